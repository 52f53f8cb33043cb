//! `snap_getEntropy`: deterministic per-snap secret material.
//!
//! Output is `HMAC-SHA256(seed, len(snap_id) ‖ snap_id ‖ len(path) ‖ path ‖
//! len(salt) ‖ salt)` as a `0x`-prefixed hex string, with each length a
//! big-endian u64. Two snaps never share entropy, and the host
//! seed itself is never exposed.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use super::GET_ENTROPY;
use crate::capability::{CaveatKind, Endowment, EndowmentContext};
use crate::error::{ExecutionError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct EntropyParams {
    path: String,
    #[serde(default)]
    salt: Option<String>,
}

pub struct EntropyEndowment {
    seed: Arc<[u8]>,
}

impl EntropyEndowment {
    pub fn new(seed: Arc<[u8]>) -> Self {
        Self { seed }
    }

    fn derive(&self, snap_id: &str, path: &str, salt: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.seed)
            .map_err(|e| ExecutionError::Internal(format!("entropy key: {e}")))?;
        for field in [snap_id, path, salt] {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field.as_bytes());
        }
        Ok(format!("0x{}", hex::encode(mac.finalize().into_bytes())))
    }
}

#[async_trait]
impl Endowment for EntropyEndowment {
    fn name(&self) -> &str {
        GET_ENTROPY
    }

    fn supported_caveats(&self) -> &[CaveatKind] {
        &[CaveatKind::AllowedPaths]
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value> {
        let params: EntropyParams = serde_json::from_value(params)
            .map_err(|e| ExecutionError::InvalidParams(format!("{GET_ENTROPY}: {e}")))?;
        if params.path != "m" && !params.path.starts_with("m/") {
            return Err(ExecutionError::InvalidParams(format!(
                "path must start with 'm/', got '{}'",
                params.path
            )));
        }
        let entropy = self.derive(
            context.snap_id.as_str(),
            &params.path,
            params.salt.as_deref().unwrap_or_default(),
        )?;
        Ok(json!(entropy))
    }
}
