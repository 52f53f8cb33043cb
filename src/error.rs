//! Typed errors surfaced at the execution-service boundary.
//!
//! Every error carries a JSON-RPC style code so it can travel over the
//! command wire (`{message, code, data?}`) and be reconstructed on the
//! other side without losing its category.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC style error codes used on the wire.
pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL: i64 = -32603;
    pub const RESOURCE_UNAVAILABLE: i64 = -32002;
    pub const TIMEOUT: i64 = -32003;
    pub const LIMIT_EXCEEDED: i64 = -32005;
    pub const TRANSPORT: i64 = -32010;
    pub const UNAUTHORIZED: i64 = 4100;
}

/// Error body carried by a terminal command response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            data: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Too many requests from origin '{origin}'")]
    TooManyRequests { origin: String },

    #[error("Unmatched decrement for origin '{origin}': no outstanding request")]
    QueueUnderflow { origin: String },

    #[error("Origin '{origin}' is not allowed to call snap '{snap_id}'")]
    Unauthorized { origin: String, snap_id: String },

    #[error("Snap '{0}' is not installed")]
    SnapNotFound(String),

    #[error("Command '{command}' to {peer} timed out after {timeout_ms}ms")]
    Timeout {
        peer: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("Job {job} terminated")]
    Terminated { job: String },

    #[error("The method \"{0}\" does not exist / is not available")]
    MethodNotFound(String),

    #[error("Caveat violation on '{capability}': {reason}")]
    CaveatViolation { capability: String, reason: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Attenuation failed: {0}")]
    Attenuation(String),

    #[error("{message}")]
    Remote {
        message: String,
        code: i64,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sandbox runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

impl ExecutionError {
    /// Wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::TooManyRequests { .. } => codes::LIMIT_EXCEEDED,
            Self::Unauthorized { .. } => codes::UNAUTHORIZED,
            Self::SnapNotFound(_) | Self::Terminated { .. } => codes::RESOURCE_UNAVAILABLE,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::CaveatViolation { .. } => codes::UNAUTHORIZED,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::Remote { code, .. } => *code,
            Self::Transport(_) => codes::TRANSPORT,
            Self::QueueUnderflow { .. }
            | Self::Attenuation(_)
            | Self::Runtime(_)
            | Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// Returns true if the error means the job can no longer serve calls.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Terminated { .. } | Self::Transport(_) | Self::Runtime(_)
        )
    }

    /// Converts the error into the body sent on the command wire.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Remote {
                message,
                code,
                data,
            } => RpcError {
                message: message.clone(),
                code: *code,
                data: data.clone(),
            },
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

impl From<RpcError> for ExecutionError {
    fn from(err: RpcError) -> Self {
        Self::Remote {
            message: err.message,
            code: err.code,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization: {err}"))
    }
}
