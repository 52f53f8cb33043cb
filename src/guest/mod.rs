//! Sandbox end of the protocol.
//!
//! [`SnapExecutor`] is what runs inside a sandbox: it completes the stream
//! handshake, answers `ping`, loads snaps on `executeSnap`, dispatches
//! `snapRpc` to the loaded snap and stops on `terminate`. A snap reaches
//! the host only through its [`SnapEnvironment`], which knows nothing but
//! the names of the endowments it was granted.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::{codes, ExecutionError, Result, RpcError};
use crate::lock;
use crate::rpc::{
    CommandEngine, CommandRequest, CommandResponse, Notification, UNHANDLED_ERROR_NOTIFICATION,
};
use crate::runtime::{CHILD_CHANNEL, HOST_IDENTITY, PARENT_CHANNEL};
use crate::snap::{HandlerType, SnapId};
use crate::transport::mux::{COMMAND_SUBSTREAM, RPC_SUBSTREAM};
use crate::transport::{
    FrameSink, MessagePort, Multiplex, StreamOptions, SubstreamWriter, TransportStream,
};

/// How long a snap waits for the host to answer an endowment call.
const HOST_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Sandboxed third-party code.
#[async_trait]
pub trait Snap: Send + Sync {
    async fn on_request(
        &self,
        handler: HandlerType,
        origin: &str,
        request: Value,
        env: &SnapEnvironment,
    ) -> anyhow::Result<Value>;
}

/// Turns source code into a runnable snap.
pub trait SnapLoader: Send + Sync {
    fn load(&self, snap_id: &SnapId, source: &str) -> anyhow::Result<Arc<dyn Snap>>;
}

/// Loader over a fixed set of compiled-in snaps, keyed by source name.
#[derive(Default, Clone)]
pub struct SnapRegistry {
    snaps: HashMap<String, Arc<dyn Snap>>,
}

impl SnapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: &str, snap: Arc<dyn Snap>) {
        self.snaps.insert(source.to_string(), snap);
    }

    pub fn with(mut self, source: &str, snap: Arc<dyn Snap>) -> Self {
        self.register(source, snap);
        self
    }
}

impl SnapLoader for SnapRegistry {
    fn load(&self, snap_id: &SnapId, source: &str) -> anyhow::Result<Arc<dyn Snap>> {
        self.snaps
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no snap named '{source}' available for {snap_id}"))
    }
}

/// The only view of the host a snap gets.
#[derive(Clone)]
pub struct SnapEnvironment {
    endowments: Arc<BTreeSet<String>>,
    host: Arc<CommandEngine>,
}

impl SnapEnvironment {
    fn new(endowments: Vec<String>, host: Arc<CommandEngine>) -> Self {
        Self {
            endowments: Arc::new(endowments.into_iter().collect()),
            host,
        }
    }

    pub fn has(&self, endowment: &str) -> bool {
        self.endowments.contains(endowment)
    }

    pub fn endowments(&self) -> impl Iterator<Item = &str> {
        self.endowments.iter().map(String::as_str)
    }

    /// Calls a granted endowment on the host.
    ///
    /// Names outside the grant fail locally with "method not found",
    /// without any traffic to the host.
    pub async fn request(&self, endowment: &str, params: Value) -> Result<Value> {
        if !self.has(endowment) {
            return Err(ExecutionError::MethodNotFound(endowment.to_string()));
        }
        self.host
            .send(endowment, Some(params), Some(HOST_CALL_TIMEOUT))
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteSnapParams {
    snap_id: SnapId,
    source_code: String,
    #[serde(default)]
    endowments: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapRpcParams {
    snap_id: SnapId,
    origin: String,
    #[serde(default)]
    handler: HandlerType,
    request: Value,
}

struct LoadedSnap {
    snap: Arc<dyn Snap>,
    env: SnapEnvironment,
}

enum Flow {
    Continue,
    Stop,
}

/// Runs the sandbox side of one job until `terminate` or until the host
/// goes away.
pub struct SnapExecutor {
    port: MessagePort,
    loader: Arc<dyn SnapLoader>,
}

impl SnapExecutor {
    pub fn new(port: MessagePort, loader: Arc<dyn SnapLoader>) -> Self {
        Self { port, loader }
    }

    pub async fn run(self) {
        let stream = TransportStream::new(
            self.port,
            StreamOptions::new(CHILD_CHANNEL, PARENT_CHANNEL).with_expected_sender(HOST_IDENTITY),
        );
        let raw = stream.writer();
        let mut mux = Multiplex::new(stream);
        let mut commands = mux.substream(COMMAND_SUBSTREAM);
        let mut rpc = mux.substream(RPC_SUBSTREAM);
        let mux_task = tokio::spawn(mux.run());

        let host = Arc::new(CommandEngine::new(HOST_IDENTITY, Arc::new(rpc.writer)));
        let rpc_host = host.clone();
        let rpc_task = tokio::spawn(async move {
            while let Some(message) = rpc.inbound.recv().await {
                rpc_host.handle_response(message);
            }
        });

        let dispatcher = Dispatcher {
            loader: self.loader,
            host: host.clone(),
            responses: commands.writer.clone(),
            snaps: Arc::new(Mutex::new(HashMap::new())),
        };
        while let Some(message) = commands.inbound.recv().await {
            if let Flow::Stop = dispatcher.dispatch(message) {
                break;
            }
        }

        info!("snap executor stopping");
        host.reject_all(|| ExecutionError::Terminated {
            job: HOST_IDENTITY.to_string(),
        });
        raw.destroy();
        rpc_task.abort();
        mux_task.abort();
    }
}

struct Dispatcher {
    loader: Arc<dyn SnapLoader>,
    host: Arc<CommandEngine>,
    responses: SubstreamWriter,
    snaps: Arc<Mutex<HashMap<SnapId, LoadedSnap>>>,
}

impl Dispatcher {
    fn respond(&self, response: CommandResponse) {
        respond(&self.responses, response);
    }

    fn dispatch(&self, message: Value) -> Flow {
        let request: CommandRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping malformed command: {e}");
                return Flow::Continue;
            }
        };
        debug!(id = request.id, command = %request.command, "command received");

        match request.command.as_str() {
            "ping" => self.respond(CommandResponse::ok(request.id, json!("OK"))),
            "executeSnap" => {
                let outcome = self.execute_snap(request.data);
                self.respond(CommandResponse::from_result(request.id, outcome));
            }
            "snapRpc" => self.snap_rpc(request.id, request.data),
            "terminate" => {
                self.respond(CommandResponse::ok(request.id, json!("OK")));
                return Flow::Stop;
            }
            other => self.respond(CommandResponse::err(
                request.id,
                &ExecutionError::MethodNotFound(other.to_string()),
            )),
        }
        Flow::Continue
    }

    fn execute_snap(&self, data: Option<Value>) -> Result<Value> {
        let params: ExecuteSnapParams =
            serde_json::from_value(data.unwrap_or(Value::Null)).map_err(|e| {
                ExecutionError::InvalidParams(format!("executeSnap: {e}"))
            })?;
        let snap = self
            .loader
            .load(&params.snap_id, &params.source_code)
            .map_err(|e| ExecutionError::Internal(format!("{e:#}")))?;
        info!(
            snap = %params.snap_id,
            endowments = ?params.endowments,
            "snap loaded"
        );
        let env = SnapEnvironment::new(params.endowments, self.host.clone());
        lock(&self.snaps).insert(params.snap_id, LoadedSnap { snap, env });
        Ok(json!("OK"))
    }

    fn snap_rpc(&self, id: u64, data: Option<Value>) {
        let params: SnapRpcParams = match serde_json::from_value(data.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => {
                let err = ExecutionError::InvalidParams(format!("snapRpc: {e}"));
                return self.respond(CommandResponse::err(id, &err));
            }
        };
        let loaded = lock(&self.snaps)
            .get(&params.snap_id)
            .map(|loaded| (loaded.snap.clone(), loaded.env.clone()));
        let Some((snap, env)) = loaded else {
            let err = ExecutionError::SnapNotFound(params.snap_id.to_string());
            return self.respond(CommandResponse::err(id, &err));
        };

        let responses = self.responses.clone();
        tokio::spawn(async move {
            let handler = params.handler;
            let handler_task = tokio::spawn(async move {
                snap.on_request(handler, &params.origin, params.request, &env)
                    .await
            });
            let response = match handler_task.await {
                Ok(Ok(result)) => CommandResponse::ok(id, result),
                Ok(Err(e)) => CommandResponse {
                    id,
                    result: None,
                    error: Some(handler_error(&e)),
                },
                Err(e) => {
                    let error =
                        RpcError::new(codes::INTERNAL, format!("snap handler crashed: {e}"));
                    error!(%handler, "{}", error.message);
                    let notification = Notification {
                        method: UNHANDLED_ERROR_NOTIFICATION.to_string(),
                        params: json!({ "error": error }),
                    };
                    match serde_json::to_value(&notification) {
                        Ok(value) => {
                            if let Err(e) = responses.write(value) {
                                debug!("cannot report unhandled error: {e}");
                            }
                        }
                        Err(e) => debug!("cannot encode notification: {e}"),
                    }
                    CommandResponse {
                        id,
                        result: None,
                        error: Some(error),
                    }
                }
            };
            respond(&responses, response);
        });
    }
}

fn respond(writer: &SubstreamWriter, response: CommandResponse) {
    let id = response.id;
    let value = match serde_json::to_value(&response) {
        Ok(value) => value,
        Err(e) => {
            warn!(id, "cannot encode response: {e}");
            return;
        }
    };
    if let Err(e) = writer.write(value) {
        debug!(id, "response not delivered: {e}");
    }
}

/// Maps a snap's error to the wire, keeping the code of typed errors.
fn handler_error(e: &anyhow::Error) -> RpcError {
    match e.downcast_ref::<ExecutionError>() {
        Some(err) => err.to_rpc_error(),
        None => RpcError::new(codes::INTERNAL, format!("{e:#}")),
    }
}

/// Spawns an executor on an in-memory port. Used by the in-process runtime.
pub(crate) fn spawn_executor(
    port: MessagePort,
    loader: Arc<dyn SnapLoader>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(SnapExecutor::new(port, loader).run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl Snap for Echo {
        async fn on_request(
            &self,
            handler: HandlerType,
            origin: &str,
            request: Value,
            env: &SnapEnvironment,
        ) -> anyhow::Result<Value> {
            match request["method"].as_str() {
                Some("fail") => Err(ExecutionError::Remote {
                    message: "custom".into(),
                    code: -31000,
                    data: None,
                }
                .into()),
                Some("oops") => anyhow::bail!("plain failure"),
                Some("panic") => panic!("snap blew up"),
                Some("secret") => Ok(env.request("snap_getEntropy", json!({"path": "m"})).await?),
                _ => Ok(json!({
                    "handler": handler.as_str(),
                    "origin": origin,
                    "endowments": env.endowments().collect::<Vec<_>>(),
                })),
            }
        }
    }

    /// Host-side harness driving an executor over an in-memory port.
    struct Harness {
        commands: Arc<CommandEngine>,
        notifications: mpsc::UnboundedReceiver<Value>,
        rpc: crate::transport::Substream,
    }

    fn harness() -> Harness {
        let (host_port, sandbox_port) = channel_pair(HOST_IDENTITY, "job-1");
        let loader = Arc::new(SnapRegistry::new().with("echo", Arc::new(Echo)));
        spawn_executor(sandbox_port, loader);

        let mut mux = Multiplex::new(TransportStream::new(
            host_port,
            StreamOptions::new(PARENT_CHANNEL, CHILD_CHANNEL).with_expected_sender("job-1"),
        ));
        let mut command = mux.substream(COMMAND_SUBSTREAM);
        let rpc = mux.substream(RPC_SUBSTREAM);
        tokio::spawn(mux.run());

        let commands = Arc::new(CommandEngine::new("job-1", Arc::new(command.writer)));
        let (note_tx, notifications) = mpsc::unbounded_channel();
        let engine = commands.clone();
        tokio::spawn(async move {
            while let Some(message) = command.inbound.recv().await {
                if message.get("method").is_some() {
                    let _ = note_tx.send(message);
                } else {
                    engine.handle_response(message);
                }
            }
        });
        Harness {
            commands,
            notifications,
            rpc,
        }
    }

    async fn load_echo(h: &Harness, endowments: Value) {
        let ack = h
            .commands
            .send(
                "executeSnap",
                Some(json!({
                    "snapId": "local:echo",
                    "sourceCode": "echo",
                    "endowments": endowments,
                })),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ack, json!("OK"));
    }

    fn rpc_call(method: &str) -> Value {
        json!({
            "snapId": "local:echo",
            "origin": "https://dapp.example",
            "handler": "onRpcRequest",
            "request": {"method": method},
        })
    }

    #[tokio::test]
    async fn test_ping_and_snap_rpc() {
        let h = harness();
        assert_eq!(h.commands.send("ping", None, None).await.unwrap(), json!("OK"));
        load_echo(&h, json!(["snap_manageState"])).await;

        let result = h
            .commands
            .send("snapRpc", Some(rpc_call("hello")), None)
            .await
            .unwrap();
        assert_eq!(result["origin"], "https://dapp.example");
        assert_eq!(result["handler"], "onRpcRequest");
        assert_eq!(result["endowments"], json!(["snap_manageState"]));
    }

    #[tokio::test]
    async fn test_unknown_command_and_unknown_snap() {
        let h = harness();
        let err = h.commands.send("selfDestruct", None, None).await.unwrap_err();
        assert_eq!(err.code(), codes::METHOD_NOT_FOUND);

        let err = h
            .commands
            .send("snapRpc", Some(rpc_call("hello")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::RESOURCE_UNAVAILABLE);

        let err = h
            .commands
            .send("executeSnap", Some(json!({"snapId": "local:x", "sourceCode": "missing"})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL);
    }

    #[tokio::test]
    async fn test_handler_errors_keep_their_code() {
        let h = harness();
        load_echo(&h, json!([])).await;

        let err = h
            .commands
            .send("snapRpc", Some(rpc_call("fail")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), -31000);
        assert_eq!(err.to_string(), "custom");

        let err = h
            .commands
            .send("snapRpc", Some(rpc_call("oops")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL);
        assert!(err.to_string().contains("plain failure"));
    }

    #[tokio::test]
    async fn test_panic_posts_unhandled_error() {
        let mut h = harness();
        load_echo(&h, json!([])).await;

        let err = h
            .commands
            .send("snapRpc", Some(rpc_call("panic")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL);

        let note = h.notifications.recv().await.unwrap();
        assert_eq!(note["method"], UNHANDLED_ERROR_NOTIFICATION);
        assert_eq!(note["params"]["error"]["code"], codes::INTERNAL);
    }

    #[tokio::test]
    async fn test_ungranted_endowment_never_reaches_host() {
        let mut h = harness();
        load_echo(&h, json!(["snap_manageState"])).await;

        let err = h
            .commands
            .send("snapRpc", Some(rpc_call("secret")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::METHOD_NOT_FOUND);
        assert!(h.rpc.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_granted_endowment_goes_over_rpc_substream() {
        let mut h = harness();
        load_echo(&h, json!(["snap_getEntropy"])).await;

        let commands = h.commands.clone();
        let call = tokio::spawn(async move {
            commands.send("snapRpc", Some(rpc_call("secret")), None).await
        });

        let request = h.rpc.inbound.recv().await.unwrap();
        assert_eq!(request["command"], "snap_getEntropy");
        assert_eq!(request["data"], json!({"path": "m"}));
        let id = request["id"].as_u64().unwrap();
        h.rpc
            .writer
            .write(json!({"id": id, "result": "0xabc"}))
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("0xabc"));
    }

    #[tokio::test]
    async fn test_terminate_stops_executor() {
        let (host_port, sandbox_port) = channel_pair(HOST_IDENTITY, "job-1");
        let executor = spawn_executor(sandbox_port, Arc::new(SnapRegistry::new()));

        let mut mux = Multiplex::new(TransportStream::new(
            host_port,
            StreamOptions::new(PARENT_CHANNEL, CHILD_CHANNEL),
        ));
        let mut command = mux.substream(COMMAND_SUBSTREAM);
        tokio::spawn(mux.run());
        let engine = Arc::new(CommandEngine::new("job-1", Arc::new(command.writer)));
        let reader = engine.clone();
        tokio::spawn(async move {
            while let Some(message) = command.inbound.recv().await {
                reader.handle_response(message);
            }
        });

        assert_eq!(engine.send("terminate", None, None).await.unwrap(), json!("OK"));
        executor.await.unwrap();
    }
}
