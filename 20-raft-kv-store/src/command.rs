//! Commands that flow through the Raft replicated log.
//!
//! A command is encoded as a small JSON object with an `op` tag:
//!
//! ```text
//! {"op":"set","key":"a","value":"1"}
//! {"op":"delete","key":"a"}
//! ```
//!
//! Empty fields are left out when encoding and read back as `""`. Decoding is
//! strict about the tag: anything other than `set` or `delete` is an
//! [`CodecError::UnknownOp`], which the state machine treats as fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning log bytes back into a [`Command`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed command payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unrecognized command op: {0:?}")]
    UnknownOp(String),
}

/// A state-changing operation replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// On-the-wire shape of a command. Kept separate from [`Command`] so an
/// unknown tag decodes successfully and is rejected explicitly.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireCommand {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    op: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    value: String,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    /// The op tag written to the log.
    pub fn op(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = match self {
            Command::Set { key, value } => WireCommand {
                op: "set".to_string(),
                key: key.clone(),
                value: value.clone(),
            },
            Command::Delete { key } => WireCommand {
                op: "delete".to_string(),
                key: key.clone(),
                value: String::new(),
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireCommand = serde_json::from_slice(bytes)?;
        match wire.op.as_str() {
            "set" => Ok(Command::Set {
                key: wire.key,
                value: wire.value,
            }),
            "delete" => Ok(Command::Delete { key: wire.key }),
            _ => Err(CodecError::UnknownOp(wire.op)),
        }
    }
}
