//! Jobs and the service that routes requests to them.

pub mod job;
pub mod permissions;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::admission::DEFAULT_MAX_QUEUE_SIZE;
use crate::rpc::engine::DEFAULT_COMMAND_TIMEOUT;

pub use job::{AdmittedCall, ExecutionJob};
pub use permissions::{PermissionSource, SnapRecord, SnapSource, StaticSnaps};
pub use service::ExecutionService;

/// What happens to a job when a snap handler fails with an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Return the error and keep the job running.
    #[default]
    Resilient,
    /// Return the error and terminate the job.
    ExitOnError,
}

/// Lifecycle of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Created,
    Starting,
    Ready,
    Executing,
    Terminating,
    /// Carries the fault reason when the job died instead of being stopped.
    Terminated(Option<String>),
}

impl JobState {
    /// Returns true if the job can still accept calls.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Terminating | Self::Terminated(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Executing => f.write_str("executing"),
            Self::Terminating => f.write_str("terminating"),
            Self::Terminated(None) => f.write_str("terminated"),
            Self::Terminated(Some(reason)) => write!(f, "terminated ({reason})"),
        }
    }
}

/// Limits and timeouts shared by the service and its jobs.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub max_queue_size: usize,
    /// Default timeout for commands without their own, `ping` among them.
    pub command_timeout: Duration,
    /// Bound on `executeSnap` while a job starts.
    pub init_timeout: Duration,
    /// Bound on a single `snapRpc`.
    pub max_request_time: Duration,
    /// Bound on the best-effort `terminate` command.
    pub termination_timeout: Duration,
    pub runtime_mode: RuntimeMode,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            init_timeout: Duration::from_secs(60),
            max_request_time: Duration::from_secs(60),
            termination_timeout: Duration::from_secs(1),
            runtime_mode: RuntimeMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_liveness() {
        assert!(JobState::Ready.is_live());
        assert!(JobState::Executing.is_live());
        assert!(!JobState::Terminating.is_live());
        assert!(!JobState::Terminated(Some("crash".into())).is_live());
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Ready.to_string(), "ready");
        assert_eq!(
            JobState::Terminated(Some("exit 1".into())).to_string(),
            "terminated (exit 1)"
        );
    }

    #[test]
    fn test_runtime_mode_deserializes() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RuntimeMode,
        }
        let w: Wrapper = toml::from_str(r#"mode = "exit_on_error""#).unwrap();
        assert_eq!(w.mode, RuntimeMode::ExitOnError);
        assert_eq!(RuntimeMode::default(), RuntimeMode::Resilient);
    }
}
