//! Test snaps and runtimes shared by the job and service tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify, Semaphore};

use crate::capability::builtin::{MemoryStateStore, GET_ENTROPY, MANAGE_STATE, NETWORK_ACCESS};
use crate::capability::{CapabilityCatalog, HostHooks};
use crate::error::{ExecutionError, Result};
use crate::guest::{Snap, SnapEnvironment, SnapLoader, SnapRegistry};
use crate::lock;
use crate::runtime::{LocalRuntime, SandboxInstance, SandboxRuntime, HOST_IDENTITY};
use crate::snap::HandlerType;
use crate::transport::{MessagePort, RawMessage};

pub(crate) fn catalog() -> CapabilityCatalog {
    CapabilityCatalog::with_builtins(
        HostHooks::new(Arc::new(MemoryStateStore::default())).with_entropy_seed(b"test seed"),
    )
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A snap whose behavior is picked by `request.method`.
///
/// `wait` blocks on `gate` after signalling `entered`, so tests can hold a
/// call in flight for as long as they need.
pub(crate) struct Lab {
    pub entered: Arc<Notify>,
    pub gate: Arc<Semaphore>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Lab {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn loader(&self) -> Arc<dyn SnapLoader> {
        let snap = LabSnap {
            entered: self.entered.clone(),
            gate: self.gate.clone(),
            log: self.log.clone(),
        };
        Arc::new(SnapRegistry::new().with("lab", Arc::new(snap)))
    }

    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }
}

struct LabSnap {
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Snap for LabSnap {
    async fn on_request(
        &self,
        _handler: HandlerType,
        origin: &str,
        request: Value,
        env: &SnapEnvironment,
    ) -> anyhow::Result<Value> {
        let method = request["method"].as_str().unwrap_or_default();
        match method {
            "hello" => Ok(json!({ "hello": origin })),
            "endowments" => Ok(json!(env.endowments().collect::<Vec<_>>())),
            "state" => {
                env.request(
                    MANAGE_STATE,
                    json!({"operation": "update", "newState": request["params"]}),
                )
                .await?;
                Ok(env.request(MANAGE_STATE, json!({"operation": "get"})).await?)
            }
            "entropy" => Ok(env.request(GET_ENTROPY, json!({"path": "m/0"})).await?),
            "fetch" => Ok(env
                .request(NETWORK_ACCESS, json!({"url": request["params"]["url"]}))
                .await?),
            "wait" => {
                let tag = request["tag"].as_str().unwrap_or("?");
                lock(&self.log).push(format!("start:{tag}"));
                self.entered.notify_one();
                self.gate.acquire().await?.forget();
                lock(&self.log).push(format!("end:{tag}"));
                Ok(json!("done"))
            }
            "fail" => anyhow::bail!("handler failed"),
            "panic" => panic!("lab snap panicked"),
            "hang" => std::future::pending().await,
            other => Err(ExecutionError::MethodNotFound(other.to_string()).into()),
        }
    }
}

/// Local runtime that records every command the host sends.
///
/// It can also swallow chosen commands before they reach the sandbox, and
/// cut the sandbox → host direction of every existing instance without
/// the sandbox noticing.
pub(crate) struct RecordingRuntime {
    inner: LocalRuntime,
    commands: Arc<Mutex<Vec<String>>>,
    muted: Arc<Mutex<Vec<String>>>,
    cut: watch::Sender<u64>,
}

impl RecordingRuntime {
    pub fn new(loader: Arc<dyn SnapLoader>) -> Self {
        Self {
            inner: LocalRuntime::new(loader),
            commands: Arc::new(Mutex::new(Vec::new())),
            muted: Arc::new(Mutex::new(Vec::new())),
            cut: watch::channel(0).0,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// `command` is still recorded but never delivered.
    pub fn mute(&self, command: &str) {
        lock(&self.muted).push(command.to_string());
    }

    /// Drops the sandbox → host pipe of every instance created so far.
    pub fn sever(&self) {
        self.cut.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl SandboxRuntime for RecordingRuntime {
    async fn create(&self, job_id: &str) -> Result<SandboxInstance> {
        let SandboxInstance {
            port,
            exit,
            control,
        } = self.inner.create(job_id).await?;
        let (to_sandbox, mut from_sandbox) = port.split();

        let (host_tx, mut host_out) = mpsc::unbounded_channel::<RawMessage>();
        let (host_in, host_rx) = mpsc::unbounded_channel::<RawMessage>();

        let commands = self.commands.clone();
        let muted = self.muted.clone();
        tokio::spawn(async move {
            while let Some(message) = host_out.recv().await {
                let data = message.data.unwrap_or(Value::Null);
                if data.pointer("/payload/name") == Some(&json!("command")) {
                    let command = data.pointer("/payload/data/command").and_then(Value::as_str);
                    if let Some(command) = command {
                        lock(&commands).push(command.to_string());
                        if lock(&muted).iter().any(|m| m == command) {
                            continue;
                        }
                    }
                }
                if to_sandbox.post(&message.target, data).is_err() {
                    break;
                }
            }
        });
        let mut cut = self.cut.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok(()) = cut.changed() => break,
                    message = from_sandbox.recv() => {
                        let Some(message) = message else { break };
                        if host_in.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(SandboxInstance {
            port: MessagePort::new(HOST_IDENTITY, host_tx, host_rx),
            exit,
            control,
        })
    }
}
