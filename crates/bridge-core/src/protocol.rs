use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Discriminator stamped on every outbound message
pub const TARGET: &str = "custom";

// --- Inbound command tags ---

pub const CALL_MAIN: &str = "callMain";
pub const FS_UNLINK: &str = "FS_unlink";
pub const FS_CREATE_DATA_FILE: &str = "FS_createDataFile";
pub const CUSTOM_INIT: &str = "custom-init";
pub const FS_SYNC: &str = "FS_sync";
pub const LS: &str = "ls";
pub const CAT: &str = "cat";
pub const WRITE_FILE: &str = "write-file";
pub const DELETE_FILE: &str = "delete-file";

// --- Outbound response names ---

pub const CALL_MAIN_COMPLETE: &str = "callMainComplete";
pub const CUSTOM_INIT_DONE: &str = "custom-init-done";
pub const FILE_NAME: &str = "file_name";
// `cat` answers with its own tag
pub const CAT_RESPONSE: &str = CAT;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport envelope has no data.userData object")]
    MissingUserData,
    #[error("command message has no string 'command' field")]
    MissingCommand,
    #[error("invalid payload for {command}: {source}")]
    InvalidPayload {
        command: String,
        source: serde_json::Error,
    },
    #[error("payload must serialize to a JSON object")]
    NotAnObject,
}

/// Transport wrapper around inbound commands: `{ "data": { "userData": {...} } }`
#[derive(Debug, Deserialize)]
struct TransportEnvelope {
    data: TransportData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransportData {
    user_data: Option<Value>,
}

/// One inbound unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    command: String,
    payload: Map<String, Value>,
}

impl CommandMessage {
    /// Build from the `userData` object of a transport envelope
    pub fn from_user_data(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(payload) = value else {
            return Err(ProtocolError::MissingUserData);
        };
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingCommand)?
            .to_string();
        Ok(Self { command, payload })
    }

    /// Decode one transport line
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let envelope: TransportEnvelope = serde_json::from_str(line)?;
        let user_data = envelope
            .data
            .user_data
            .ok_or(ProtocolError::MissingUserData)?;
        Self::from_user_data(user_data)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Full message, `command` field included
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Parse the command-specific fields
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            ProtocolError::InvalidPayload {
                command: self.command.clone(),
                source,
            }
        })
    }
}

/// Wrap `payload` in the outbound envelope. `target` and `command` always win
/// over same-named payload fields.
pub fn envelope(command: &str, mut payload: Map<String, Value>) -> Value {
    payload.insert("target".to_string(), Value::String(TARGET.to_string()));
    payload.insert("command".to_string(), Value::String(command.to_string()));
    Value::Object(payload)
}

/// Serialize a typed payload into envelope fields
pub fn to_fields<T: Serialize>(data: &T) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(data)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(ProtocolError::NotAnObject),
    }
}

// --- JSON payload types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMainRequest {
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataFileRequest {
    pub dir: String,
    pub filename: String,
    pub content: String,
}

/// Payload of `cat` and `delete-file`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNameEntry {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatResponse {
    pub name: String,
    pub content: String,
}
