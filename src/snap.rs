//! Snap identities and the requests routed to them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque snap identity, e.g. `local:my-snap` or `npm:@acme/wallet`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapId(String);

impl SnapId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Snap entry point a request is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HandlerType {
    #[default]
    OnRpcRequest,
    OnCronjob,
    OnTransaction,
    OnInstall,
    OnUpdate,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnRpcRequest => "onRpcRequest",
            Self::OnCronjob => "onCronjob",
            Self::OnTransaction => "onTransaction",
            Self::OnInstall => "onInstall",
            Self::OnUpdate => "onUpdate",
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one snap handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapRequest {
    #[serde(default)]
    pub handler: HandlerType,
    pub request: Value,
}

impl SnapRequest {
    pub fn rpc(request: Value) -> Self {
        Self {
            handler: HandlerType::OnRpcRequest,
            request,
        }
    }

    /// Convenience for `{ "method": <method> }` RPC requests.
    pub fn method(method: &str) -> Self {
        Self::rpc(serde_json::json!({ "method": method }))
    }
}
