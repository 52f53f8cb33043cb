use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::{Caveat, CaveatKind, Endowment, EndowmentContext};
use crate::error::{ExecutionError, Result};

/// Wraps an endowment so every call is checked against all of its caveats
/// before it reaches the real implementation.
pub struct CaveatGuard {
    inner: Arc<dyn Endowment>,
    caveats: Vec<Caveat>,
}

impl CaveatGuard {
    pub fn new(inner: Arc<dyn Endowment>, caveats: Vec<Caveat>) -> Self {
        Self { inner, caveats }
    }
}

#[async_trait]
impl Endowment for CaveatGuard {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supported_caveats(&self) -> &[CaveatKind] {
        self.inner.supported_caveats()
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value> {
        for caveat in &self.caveats {
            if let Err(reason) = caveat.check(&params) {
                warn!(
                    snap = %context.snap_id,
                    capability = self.inner.name(),
                    caveat = %caveat.kind(),
                    "caveat rejected call: {reason}"
                );
                return Err(ExecutionError::CaveatViolation {
                    capability: self.inner.name().to_string(),
                    reason,
                });
            }
        }
        self.inner.invoke(params, context).await
    }
}

impl Caveat {
    /// Checks one call's params. Returns the rejection reason on violation.
    pub fn check(&self, params: &Value) -> std::result::Result<(), String> {
        match self {
            Self::AllowedOrigins(allowed) => check_origin(allowed, params),
            Self::AllowedPaths(allowed) => check_path(allowed, params),
            Self::MaxBytes(limit) => check_size(*limit, params),
        }
    }
}

/// Normalizes a configured origin (`https://host`, `https://host/`, ...).
fn normalize_origin(origin: &str) -> String {
    match Url::parse(origin) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => origin.trim_end_matches('/').to_string(),
    }
}

fn check_origin(allowed: &[String], params: &Value) -> std::result::Result<(), String> {
    let raw = params["url"]
        .as_str()
        .ok_or_else(|| "missing 'url' parameter".to_string())?;
    let url = Url::parse(raw).map_err(|e| format!("invalid url '{raw}': {e}"))?;
    let origin = url.origin().ascii_serialization();
    if allowed
        .iter()
        .any(|entry| entry == "*" || normalize_origin(entry) == origin)
    {
        Ok(())
    } else {
        Err(format!("origin '{origin}' is not allowed"))
    }
}

fn check_path(allowed: &[String], params: &Value) -> std::result::Result<(), String> {
    let path = params["path"]
        .as_str()
        .ok_or_else(|| "missing 'path' parameter".to_string())?;
    let path = path.trim_end_matches('/');
    let permitted = allowed.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    });
    if permitted {
        Ok(())
    } else {
        Err(format!("path '{path}' is not allowed"))
    }
}

fn check_size(limit: usize, params: &Value) -> std::result::Result<(), String> {
    let Some(data) = params.get("newState") else {
        return Ok(());
    };
    let size = serde_json::to_vec(data).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > limit {
        Err(format!("{size} bytes exceeds the {limit} byte limit"))
    } else {
        Ok(())
    }
}
