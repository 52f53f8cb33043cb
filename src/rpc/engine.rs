use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{CommandRequest, MAX_SAFE_INTEGER};
use crate::error::{ExecutionError, Result, RpcError};
use crate::lock;
use crate::transport::FrameSink;

/// Default time a command may stay unanswered.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

type Continuation = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
    last_id: u64,
    waiters: HashMap<u64, Continuation>,
}

/// Matches command responses to their requests by id.
///
/// One engine per peer. Every command resolves exactly once: with the
/// peer's result, the peer's error, a timeout, or a termination error.
/// Malformed or unsolicited responses are logged and dropped.
pub struct CommandEngine {
    peer: String,
    sink: Arc<dyn FrameSink>,
    pending: Mutex<Pending>,
    default_timeout: Duration,
}

/// Removes the waiter when `send` returns or its future is dropped.
struct PendingGuard<'a> {
    engine: &'a CommandEngine,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.engine.pending).waiters.remove(&self.id);
    }
}

impl CommandEngine {
    pub fn new(peer: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            peer: peer.into(),
            sink,
            pending: Mutex::new(Pending::default()),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a command and waits for its correlated response.
    pub async fn send(
        &self,
        command: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let id = self.register(tx);
        let _guard = PendingGuard { engine: self, id };

        let request = CommandRequest {
            id,
            command: command.to_string(),
            data,
        };
        self.sink.write(serde_json::to_value(&request)?)?;
        trace!(peer = %self.peer, id, command, "command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExecutionError::Terminated {
                job: self.peer.clone(),
            }),
            Err(_) => {
                warn!(peer = %self.peer, id, command, "command timed out");
                Err(ExecutionError::Timeout {
                    peer: self.peer.clone(),
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Assigns the next free id and stores the continuation under it.
    fn register(&self, continuation: Continuation) -> u64 {
        let mut pending = lock(&self.pending);
        let mut id = pending.last_id;
        loop {
            id = id % MAX_SAFE_INTEGER + 1;
            if !pending.waiters.contains_key(&id) {
                break;
            }
        }
        pending.last_id = id;
        pending.waiters.insert(id, continuation);
        id
    }

    /// Handles one inbound response frame.
    pub fn handle_response(&self, message: Value) {
        let Some(object) = message.as_object() else {
            warn!(peer = %self.peer, "dropping non-object response");
            return;
        };
        let Some(id) = object.get("id").and_then(Value::as_u64) else {
            warn!(peer = %self.peer, "dropping response without a numeric id");
            return;
        };
        let error = object.get("error");
        let result = object.get("result");
        if error.is_none() && result.is_none() {
            warn!(peer = %self.peer, id, "dropping response with neither result nor error");
            return;
        }

        let Some(waiter) = lock(&self.pending).waiters.remove(&id) else {
            warn!(peer = %self.peer, id, "dropping response for untracked id");
            return;
        };

        let outcome = match error {
            Some(body) => Err(match serde_json::from_value::<RpcError>(body.clone()) {
                Ok(rpc_error) => ExecutionError::from(rpc_error),
                Err(_) => ExecutionError::Remote {
                    message: format!("malformed error from {}: {body}", self.peer),
                    code: crate::error::codes::INTERNAL,
                    data: None,
                },
            }),
            None => Ok(result.cloned().unwrap_or(Value::Null)),
        };
        if waiter.send(outcome).is_err() {
            debug!(peer = %self.peer, id, "caller stopped waiting before response arrived");
        }
    }

    /// Rejects every in-flight command with `error_for()`.
    pub fn reject_all(&self, error_for: impl Fn() -> ExecutionError) {
        let waiters: Vec<_> = lock(&self.pending).waiters.drain().collect();
        if !waiters.is_empty() {
            debug!(peer = %self.peer, count = waiters.len(), "rejecting pending commands");
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error_for()));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.pending).waiters.contains_key(&id)
    }
}
