//! `snap_manageState`: the only way sandboxed state reaches the host.
//!
//! Snapshots are stored per snap as JSON documents. The file-backed store
//! writes one `<snap>.json` per snap under its base directory, going
//! through a temporary file so a crash never leaves a torn snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::MANAGE_STATE;
use crate::capability::{CaveatKind, Endowment, EndowmentContext};
use crate::error::{ExecutionError, Result};
use crate::lock;
use crate::snap::SnapId;

/// Persistence behind `snap_manageState`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, snap_id: &SnapId) -> Result<Option<Value>>;
    async fn set(&self, snap_id: &SnapId, state: Value) -> Result<()>;
    async fn clear(&self, snap_id: &SnapId) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<SnapId, Value>>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, snap_id: &SnapId) -> Result<Option<Value>> {
        Ok(lock(&self.states).get(snap_id).cloned())
    }

    async fn set(&self, snap_id: &SnapId, state: Value) -> Result<()> {
        lock(&self.states).insert(snap_id.clone(), state);
        Ok(())
    }

    async fn clear(&self, snap_id: &SnapId) -> Result<()> {
        lock(&self.states).remove(snap_id);
        Ok(())
    }
}

/// On-disk snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    snap_id: SnapId,
    updated: String,
    state: Value,
}

pub struct FileStateStore {
    base_path: PathBuf,
}

impl FileStateStore {
    pub fn open(base_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_path).map_err(|e| {
            ExecutionError::Internal(format!(
                "cannot create state directory {}: {e}",
                base_path.display()
            ))
        })?;
        info!("State store at {}", base_path.display());
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Maps a snap id to a file name that cannot escape the base directory.
    /// The name is the hex of the id, so distinct ids never share a file.
    fn snapshot_path(&self, snap_id: &SnapId) -> PathBuf {
        self.base_path
            .join(format!("{}.json", hex::encode(snap_id.as_str())))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ExecutionError {
    ExecutionError::Internal(format!("state I/O on {}: {e}", path.display()))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, snap_id: &SnapId) -> Result<Option<Value>> {
        let path = self.snapshot_path(snap_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.snap_id != *snap_id {
                    warn!(
                        snap = %snap_id,
                        owner = %snapshot.snap_id,
                        "ignoring snapshot written for another snap"
                    );
                    return Ok(None);
                }
                Ok(Some(snapshot.state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn set(&self, snap_id: &SnapId, state: Value) -> Result<()> {
        let path = self.snapshot_path(snap_id);
        let snapshot = Snapshot {
            snap_id: snap_id.clone(),
            updated: chrono::Utc::now().to_rfc3339(),
            state,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(snap = %snap_id, "state snapshot written");
        Ok(())
    }

    async fn clear(&self, snap_id: &SnapId) -> Result<()> {
        let path = self.snapshot_path(snap_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManageStateParams {
    operation: Operation,
    new_state: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum Operation {
    Get,
    Update,
    Clear,
}

pub struct ManageStateEndowment {
    store: Arc<dyn StateStore>,
}

impl ManageStateEndowment {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Endowment for ManageStateEndowment {
    fn name(&self) -> &str {
        MANAGE_STATE
    }

    fn supported_caveats(&self) -> &[CaveatKind] {
        &[CaveatKind::MaxBytes]
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value> {
        let params: ManageStateParams = serde_json::from_value(params)
            .map_err(|e| ExecutionError::InvalidParams(format!("{MANAGE_STATE}: {e}")))?;

        match params.operation {
            Operation::Get => Ok(self.store.get(&context.snap_id).await?.unwrap_or(Value::Null)),
            Operation::Update => {
                let state = params.new_state.ok_or_else(|| {
                    ExecutionError::InvalidParams("missing required parameter: newState".into())
                })?;
                if !state.is_object() {
                    return Err(ExecutionError::InvalidParams(
                        "newState must be a JSON object".into(),
                    ));
                }
                self.store.set(&context.snap_id, state).await?;
                Ok(Value::Null)
            }
            Operation::Clear => {
                self.store.clear(&context.snap_id).await?;
                Ok(Value::Null)
            }
        }
    }
}
