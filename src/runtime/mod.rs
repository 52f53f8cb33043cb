//! Sandbox runtimes: the isolation primitive behind a job.
//!
//! The core never looks inside a sandbox. A runtime hands back a raw
//! [`MessagePort`] connected to the sandboxed program, a one-shot channel
//! that fires with a fault reason when the sandbox dies, and a control
//! handle to tear it down. Everything else (load, invoke, terminate) is
//! framed as commands over the port.

pub mod local;
pub mod process;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::transport::MessagePort;

pub use local::LocalRuntime;
pub use process::ProcessRuntime;

/// Identity stamped on every message the host posts into a sandbox.
/// The sandbox end of a job is identified by the job id.
pub const HOST_IDENTITY: &str = "host";

/// Channel name of the host end of a job stream.
pub const PARENT_CHANNEL: &str = "parent";

/// Channel name of the sandbox end of a job stream.
pub const CHILD_CHANNEL: &str = "child";

/// A freshly created sandbox, connected but not yet loaded with code.
pub struct SandboxInstance {
    pub port: MessagePort,
    /// Resolves with a reason when the sandbox exits or crashes.
    pub exit: oneshot::Receiver<String>,
    pub control: Box<dyn SandboxControl>,
}

#[async_trait]
pub trait SandboxControl: Send + Sync {
    /// Forcefully stops the sandbox. Idempotent.
    async fn terminate(&self);
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Allocates a sandbox for `job_id`.
    async fn create(&self, job_id: &str) -> Result<SandboxInstance>;
}
