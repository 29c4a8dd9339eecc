use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messenger::Messenger;
use crate::protocol::CommandMessage;

/// Events received from the host
#[derive(Debug)]
pub enum HostEvent {
    /// A decoded command message
    Command(CommandMessage),
    /// Inbound stream ended
    Closed,
}

/// Both halves of a running line-delimited JSON transport
pub struct Transport {
    pub messenger: Messenger,
    pub events: mpsc::Receiver<HostEvent>,
    /// Finishes once every `Messenger` clone is dropped and the queue is flushed
    pub writer: JoinHandle<()>,
}

/// Spawn reader and writer tasks over a byte stream pair, one JSON document per line
pub fn spawn<R, W>(reader: R, writer: W, capacity: usize) -> Transport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, events) = mpsc::channel(capacity);
    let (messenger, outgoing_rx) = Messenger::channel(capacity);

    tokio::spawn(read_loop(reader, event_tx));
    let writer = tokio::spawn(write_loop(writer, outgoing_rx));

    Transport {
        messenger,
        events,
        writer,
    }
}

async fn read_loop<R>(reader: R, event_tx: mpsc::Sender<HostEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("host closed the inbound stream");
                break;
            }
            Ok(_) => {
                let line = match std::str::from_utf8(&buf) {
                    Ok(line) => line.trim(),
                    Err(e) => {
                        warn!("dropping host message that is not UTF-8: {}", e);
                        continue;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                match CommandMessage::decode(line) {
                    Ok(msg) => {
                        if event_tx.send(HostEvent::Command(msg)).await.is_err() {
                            debug!("event receiver dropped, stopping reader");
                            return;
                        }
                    }
                    Err(e) => warn!("dropping malformed host message: {}", e),
                }
            }
            Err(e) => {
                error!("failed to read from host: {}", e);
                break;
            }
        }
    }

    event_tx.send(HostEvent::Closed).await.ok();
}

async fn write_loop<W>(mut writer: W, mut outgoing_rx: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outgoing_rx.recv().await {
        let mut line = match serde_json::to_vec(&envelope) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to encode outbound message: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = writer.write_all(&line).await {
            error!("failed to write to host: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("failed to flush host stream: {}", e);
            break;
        }
    }
}
