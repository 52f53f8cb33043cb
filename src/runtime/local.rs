//! In-process sandbox: the guest executor runs as a tokio task.
//!
//! Isolation here is only what the [`SnapEnvironment`] API allows; use it
//! for trusted snaps, embedding and tests.
//!
//! [`SnapEnvironment`]: crate::guest::SnapEnvironment

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{SandboxControl, SandboxInstance, SandboxRuntime, HOST_IDENTITY};
use crate::error::Result;
use crate::guest::{spawn_executor, SnapLoader};
use crate::transport::channel_pair;

pub struct LocalRuntime {
    loader: Arc<dyn SnapLoader>,
}

impl LocalRuntime {
    pub fn new(loader: Arc<dyn SnapLoader>) -> Self {
        Self { loader }
    }
}

struct TaskControl {
    abort: AbortHandle,
}

#[async_trait]
impl SandboxControl for TaskControl {
    async fn terminate(&self) {
        self.abort.abort();
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn create(&self, job_id: &str) -> Result<SandboxInstance> {
        let (host_port, sandbox_port) = channel_pair(HOST_IDENTITY, job_id);
        let task = spawn_executor(sandbox_port, self.loader.clone());
        let abort = task.abort_handle();

        let (exit_tx, exit_rx) = oneshot::channel();
        let job = job_id.to_string();
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(()) => "sandbox task ended".to_string(),
                Err(e) if e.is_panic() => "sandbox task panicked".to_string(),
                Err(_) => "sandbox task aborted".to_string(),
            };
            debug!(job = %job, "{reason}");
            let _ = exit_tx.send(reason);
        });

        Ok(SandboxInstance {
            port: host_port,
            exit: exit_rx,
            control: Box::new(TaskControl { abort }),
        })
    }
}
