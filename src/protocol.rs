//! Wire protocol types
//!
//! Request:  `{"tool": <string>, "args": <object>}`
//! Response: exactly one of
//!   `{"result": <any>}`
//!   `{"error": <string>}`
//!   `{"status": "awaiting_selection", "operation_id": <string>}`
//!
//! This is the only compatibility-critical surface of the bridge; anything
//! else (tool names, arg shapes) is handler-defined.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

/// Decoded request envelope. Immutable once decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Registered handler name.
    pub tool: String,
    /// Handler-defined arguments; absent means empty.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl RequestEnvelope {
    /// Decode a request from raw frame payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Response envelope. Exactly one variant is populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    /// Handler needs an externally observed selection before it can finish.
    /// Not an error: the client calls `continue_selection` later.
    AwaitingSelection {
        status: AwaitingStatus,
        operation_id: String,
    },
    /// Successful completion.
    Result { result: Value },
    /// Request-local failure.
    Error { error: String },
}

/// The single legal value of the `status` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AwaitingStatus {
    #[serde(rename = "awaiting_selection")]
    AwaitingSelection,
}

impl ResponseEnvelope {
    pub fn result(value: Value) -> Self {
        ResponseEnvelope::Result { result: value }
    }

    pub fn error(err: &BridgeError) -> Self {
        ResponseEnvelope::Error {
            error: err.to_string(),
        }
    }

    pub fn awaiting_selection(operation_id: String) -> Self {
        ResponseEnvelope::AwaitingSelection {
            status: AwaitingStatus::AwaitingSelection,
            operation_id,
        }
    }

    /// Encode to frame payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing Value/String cannot fail; fall back to a static
        // error body if it ever does.
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"error":"response serialization failed"}"#.to_vec())
    }
}
