//! Command wire shapes and the correlation engine.
//!
//! Outbound: `{ id, command, data? }`.
//! Inbound:  `{ id, result? , error?: {message, code, data?} }`.

pub mod engine;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecutionError, RpcError};

pub use engine::CommandEngine;

/// Largest id before the counter wraps (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl CommandResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: &ExecutionError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_rpc_error()),
        }
    }

    pub fn from_result(id: u64, outcome: Result<Value, ExecutionError>) -> Self {
        match outcome {
            Ok(value) => Self::ok(id, value),
            Err(e) => Self::err(id, &e),
        }
    }
}

/// Unsolicited message from the sandbox on the command sub-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub const UNHANDLED_ERROR_NOTIFICATION: &str = "unhandledError";
