use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol;

/// Handle for posting notifications to the host
#[derive(Clone)]
pub struct Messenger {
    tx: mpsc::Sender<Value>,
}

impl Messenger {
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    /// Messenger plus the receiving end of its outbound queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Post `{ ...payload, target: "custom", command }` to the host
    pub async fn notify(&self, command: &str, payload: Map<String, Value>) -> Result<()> {
        debug!("notify {}", command);
        self.tx
            .send(protocol::envelope(command, payload))
            .await
            .map_err(|_| anyhow::anyhow!("host channel closed"))
    }

    /// Post a notification with no payload fields
    pub async fn notify_bare(&self, command: &str) -> Result<()> {
        self.notify(command, Map::new()).await
    }

    pub async fn notify_json<T: Serialize>(&self, command: &str, payload: &T) -> Result<()> {
        let fields = protocol::to_fields(payload)?;
        self.notify(command, fields).await
    }
}
