use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{ExecutionOptions, JobState, RuntimeMode};
use crate::capability::{CapabilityCatalog, EndowmentContext, EndowmentSet, PermissionGrant};
use crate::error::{codes, ExecutionError, Result};
use crate::lock;
use crate::rpc::{
    CommandEngine, CommandRequest, CommandResponse, Notification, UNHANDLED_ERROR_NOTIFICATION,
};
use crate::runtime::{SandboxControl, SandboxRuntime, CHILD_CHANNEL, PARENT_CHANNEL};
use crate::snap::{SnapId, SnapRequest};
use crate::transport::mux::{COMMAND_SUBSTREAM, RPC_SUBSTREAM};
use crate::transport::{
    FrameSink, Multiplex, StreamOptions, StreamWriter, Substream, TransportStream,
};

/// One running sandboxed snap.
///
/// Owns the sandbox, the stream to it and the correlation engine for the
/// commands it sends. The endowment set is fixed at start; a new grant
/// means a new job.
pub struct ExecutionJob {
    id: String,
    snap_id: SnapId,
    options: ExecutionOptions,
    state: Mutex<JobState>,
    endowments: EndowmentSet,
    commands: Arc<CommandEngine>,
    stream: StreamWriter,
    control: Arc<dyn SandboxControl>,
    /// Serializes `snapRpc` calls, FIFO.
    turn: tokio::sync::Mutex<()>,
    in_flight: watch::Sender<usize>,
    retired: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Counts a call as in flight for as long as it lives.
struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// A call handed to a job. It counts as in flight from the moment it is
/// created, so a job retired in the meantime still waits for it.
pub struct AdmittedCall {
    job: Arc<ExecutionJob>,
}

impl AdmittedCall {
    pub fn job(&self) -> &Arc<ExecutionJob> {
        &self.job
    }

    pub async fn invoke(self, origin: &str, request: &SnapRequest) -> Result<Value> {
        self.job.execute(origin, request).await
    }
}

impl Drop for AdmittedCall {
    fn drop(&mut self) {
        self.job.in_flight.send_modify(|n| *n -= 1);
    }
}

impl ExecutionJob {
    /// Creates a sandbox, loads the snap into it and waits until it is ready.
    pub async fn start(
        snap_id: SnapId,
        source: String,
        grant: &PermissionGrant,
        catalog: &CapabilityCatalog,
        runtime: &dyn SandboxRuntime,
        options: ExecutionOptions,
    ) -> Result<Arc<Self>> {
        let id = Uuid::new_v4().to_string();
        let endowments = catalog.attenuate(grant)?;
        info!(job = %id, snap = %snap_id, ?endowments, "starting job");

        let instance = runtime.create(&id).await?;
        let stream = TransportStream::new(
            instance.port,
            StreamOptions::new(PARENT_CHANNEL, CHILD_CHANNEL).with_expected_sender(&id),
        );
        let writer = stream.writer();
        let mut mux = Multiplex::new(stream);
        let command = mux.substream(COMMAND_SUBSTREAM);
        let rpc = mux.substream(RPC_SUBSTREAM);
        let commands = Arc::new(
            CommandEngine::new(format!("job {id}"), Arc::new(command.writer))
                .with_default_timeout(options.command_timeout),
        );
        let (in_flight, _) = watch::channel(0);

        let job = Arc::new(Self {
            id,
            snap_id,
            options,
            state: Mutex::new(JobState::Created),
            endowments,
            commands: commands.clone(),
            stream: writer,
            control: Arc::from(instance.control),
            turn: tokio::sync::Mutex::new(()),
            in_flight,
            retired: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        *lock(&job.state) = JobState::Starting;

        let tasks = vec![
            tokio::spawn(mux.run()).abort_handle(),
            tokio::spawn(read_commands(Arc::downgrade(&job), commands, command.inbound))
                .abort_handle(),
            tokio::spawn(serve_endowments(job.context(), job.endowments.clone(), rpc))
                .abort_handle(),
            tokio::spawn(watch_exit(Arc::downgrade(&job), instance.exit)).abort_handle(),
        ];
        lock(&job.tasks).extend(tasks);

        if let Err(e) = job.boot(source).await {
            job.fail(format!("start failed: {e}"));
            return Err(e);
        }
        Ok(job)
    }

    async fn boot(&self, source: String) -> Result<()> {
        self.commands
            .send("ping", None, None)
            .await?;
        let payload = json!({
            "snapId": self.snap_id,
            "sourceCode": source,
            "endowments": self.endowments.names(),
        });
        self.commands
            .send("executeSnap", Some(payload), Some(self.options.init_timeout))
            .await?;

        let mut state = lock(&self.state);
        if *state != JobState::Starting {
            return Err(self.terminated_error());
        }
        *state = JobState::Ready;
        info!(job = %self.id, snap = %self.snap_id, "job ready");
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snap_id(&self) -> &SnapId {
        &self.snap_id
    }

    pub fn state(&self) -> JobState {
        lock(&self.state).clone()
    }

    pub fn is_live(&self) -> bool {
        lock(&self.state).is_live()
    }

    pub fn endowments(&self) -> &EndowmentSet {
        &self.endowments
    }

    /// Calls currently inside [`ExecutionJob::invoke`], queued or executing.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn context(&self) -> EndowmentContext {
        EndowmentContext {
            snap_id: self.snap_id.clone(),
            job_id: self.id.clone(),
        }
    }

    fn terminated_error(&self) -> ExecutionError {
        ExecutionError::Terminated {
            job: self.id.clone(),
        }
    }

    /// Counts a call against this job until the returned handle is
    /// invoked or dropped.
    pub fn admit(self: &Arc<Self>) -> AdmittedCall {
        self.in_flight.send_modify(|n| *n += 1);
        AdmittedCall { job: self.clone() }
    }

    /// Runs one snap handler. Calls on the same job run one at a time, in
    /// arrival order.
    pub async fn invoke(&self, origin: &str, request: &SnapRequest) -> Result<Value> {
        let _in_flight = InFlight::enter(&self.in_flight);
        self.execute(origin, request).await
    }

    async fn execute(&self, origin: &str, request: &SnapRequest) -> Result<Value> {
        let _turn = self.turn.lock().await;
        {
            let mut state = lock(&self.state);
            if !state.is_live() {
                return Err(self.terminated_error());
            }
            *state = JobState::Executing;
        }
        debug!(
            job = %self.id,
            snap = %self.snap_id,
            origin,
            handler = %request.handler,
            "invoking snap"
        );

        let payload = json!({
            "snapId": self.snap_id,
            "origin": origin,
            "handler": request.handler,
            "request": request.request,
        });
        let outcome = self
            .commands
            .send("snapRpc", Some(payload), Some(self.options.max_request_time))
            .await;

        {
            let mut state = lock(&self.state);
            if *state == JobState::Executing {
                *state = JobState::Ready;
            }
        }

        if let Err(e) = &outcome {
            if self.options.runtime_mode == RuntimeMode::ExitOnError
                && !e.is_fatal()
                && e.code() == codes::INTERNAL
            {
                warn!(
                    job = %self.id,
                    snap = %self.snap_id,
                    "snap handler failed, stopping job: {e}"
                );
                self.terminate().await;
            }
        }
        outcome
    }

    /// Stops the job once its in-flight calls have finished.
    /// New calls must go to a new job.
    pub fn retire(self: &Arc<Self>) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            job = %self.id,
            snap = %self.snap_id,
            in_flight = self.in_flight(),
            "job retired"
        );
        let job = self.clone();
        tokio::spawn(async move {
            let mut in_flight = job.in_flight.subscribe();
            let _ = in_flight.wait_for(|n| *n == 0).await;
            job.terminate().await;
        });
    }

    /// Stops the sandbox: best-effort `terminate` command, then teardown.
    /// Every pending command is rejected.
    pub async fn terminate(&self) {
        {
            let mut state = lock(&self.state);
            if !state.is_live() {
                return;
            }
            *state = JobState::Terminating;
        }
        info!(job = %self.id, snap = %self.snap_id, "terminating job");

        if let Err(e) = self
            .commands
            .send("terminate", None, Some(self.options.termination_timeout))
            .await
        {
            debug!(job = %self.id, "terminate not acknowledged: {e}");
        }
        self.control.terminate().await;
        self.teardown(None);
        info!(job = %self.id, snap = %self.snap_id, "job terminated");
    }

    /// Fatal fault: the sandbox is gone or can no longer be trusted.
    fn fail(&self, reason: String) {
        match self.state() {
            JobState::Terminated(_) => return,
            JobState::Terminating => {
                // Don't leave a graceful stop waiting on a dead sandbox.
                self.commands.reject_all(|| self.terminated_error());
                return;
            }
            _ => {}
        }
        error!(job = %self.id, snap = %self.snap_id, "job faulted: {reason}");
        self.teardown(Some(reason));
        let control = self.control.clone();
        tokio::spawn(async move { control.terminate().await });
    }

    fn teardown(&self, reason: Option<String>) {
        *lock(&self.state) = JobState::Terminated(reason);
        self.stream.destroy();
        self.commands.reject_all(|| self.terminated_error());
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for ExecutionJob {
    fn drop(&mut self) {
        self.stream.destroy();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Routes command responses to the engine and notifications to the job.
async fn read_commands(
    job: Weak<ExecutionJob>,
    commands: Arc<CommandEngine>,
    mut inbound: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(message) = inbound.recv().await {
        if message.get("id").is_some() || message.get("method").is_none() {
            commands.handle_response(message);
            continue;
        }
        let notification: Notification = match serde_json::from_value(message) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(peer = %commands.peer(), "dropping malformed notification: {e}");
                continue;
            }
        };
        if notification.method != UNHANDLED_ERROR_NOTIFICATION {
            warn!(
                peer = %commands.peer(),
                method = %notification.method,
                "ignoring unknown notification"
            );
            continue;
        }
        let message = notification
            .params
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        if let Some(job) = job.upgrade() {
            job.fail(format!("unhandled error in snap: {message}"));
        }
    }
    if let Some(job) = job.upgrade() {
        job.fail("sandbox stream closed".to_string());
    }
}

/// Host side of the `rpc` sub-stream: the sandbox's endowment calls.
/// Calls still running when this task is aborted are aborted with it.
async fn serve_endowments(context: EndowmentContext, endowments: EndowmentSet, rpc: Substream) {
    let Substream {
        writer,
        mut inbound,
    } = rpc;
    let mut calls = JoinSet::new();
    loop {
        let message = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            Some(done) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!(job = %context.job_id, "endowment call panicked");
                    }
                }
                continue;
            }
        };
        let request: CommandRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(job = %context.job_id, "dropping malformed endowment call: {e}");
                continue;
            }
        };
        let endowments = endowments.clone();
        let context = context.clone();
        let writer = writer.clone();
        calls.spawn(async move {
            trace!(
                job = %context.job_id,
                id = request.id,
                capability = %request.command,
                "endowment call"
            );
            let outcome = endowments
                .invoke(
                    &request.command,
                    request.data.unwrap_or(Value::Null),
                    &context,
                )
                .await;
            if let Err(e) = &outcome {
                debug!(
                    job = %context.job_id,
                    capability = %request.command,
                    "endowment call failed: {e}"
                );
            }
            let response = CommandResponse::from_result(request.id, outcome);
            match serde_json::to_value(&response) {
                Ok(value) => {
                    if let Err(e) = writer.write(value) {
                        debug!(job = %context.job_id, "endowment response not delivered: {e}");
                    }
                }
                Err(e) => warn!(job = %context.job_id, "cannot encode endowment response: {e}"),
            }
        });
    }
}

async fn watch_exit(job: Weak<ExecutionJob>, exit: oneshot::Receiver<String>) {
    let reason = exit
        .await
        .unwrap_or_else(|_| "sandbox runtime dropped its exit signal".to_string());
    if let Some(job) = job.upgrade() {
        job.fail(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::builtin::{GET_ENTROPY, MANAGE_STATE, NETWORK_ACCESS};
    use crate::capability::Caveat;
    use crate::capability::builtin::StateStore;
    use crate::capability::HostHooks;
    use crate::execution::testing::{catalog, wait_until, Lab, RecordingRuntime};
    use crate::runtime::LocalRuntime;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    async fn start_with(
        lab: &Lab,
        grant: PermissionGrant,
        options: ExecutionOptions,
    ) -> Arc<ExecutionJob> {
        ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "lab".to_string(),
            &grant,
            &catalog(),
            &LocalRuntime::new(lab.loader()),
            options,
        )
        .await
        .unwrap()
    }

    async fn start(lab: &Lab, grant: PermissionGrant) -> Arc<ExecutionJob> {
        start_with(lab, grant, ExecutionOptions::default()).await
    }

    fn call(method: &str) -> SnapRequest {
        SnapRequest::method(method)
    }

    fn wait(tag: &str) -> SnapRequest {
        SnapRequest::rpc(json!({"method": "wait", "tag": tag}))
    }

    #[tokio::test]
    async fn test_start_and_invoke() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(job.snap_id().as_str(), "local:my-snap");

        let result = job.invoke("https://dapp.example", &call("hello")).await.unwrap();
        assert_eq!(result, json!({"hello": "https://dapp.example"}));
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(job.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_sees_only_granted_endowments() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new().with(MANAGE_STATE, vec![])).await;
        let names = job.invoke("o", &call("endowments")).await.unwrap();
        assert_eq!(names, json!([MANAGE_STATE]));

        let err = job.invoke("o", &call("entropy")).await.unwrap_err();
        assert_eq!(err.code(), codes::METHOD_NOT_FOUND);
        assert!(job.is_live());
    }

    #[tokio::test]
    async fn test_endowment_call_round_trips_through_host() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new().with(MANAGE_STATE, vec![])).await;
        let mut request = call("state");
        request.request["params"] = json!({"count": 3});
        let state = job.invoke("o", &request).await.unwrap();
        assert_eq!(state, json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_caveat_violation_surfaces_at_call_time() {
        let lab = Lab::new();
        let grant = PermissionGrant::new().with(
            NETWORK_ACCESS,
            vec![Caveat::AllowedOrigins(vec!["https://api.example.com".into()])],
        );
        let job = start(&lab, grant).await;
        let mut request = call("fetch");
        request.request["params"] = json!({"url": "https://evil.example/steal"});
        let err = job.invoke("o", &request).await.unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
        assert!(job.is_live());
    }

    #[tokio::test]
    async fn test_entropy_is_scoped_to_snap() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new().with(GET_ENTROPY, vec![])).await;
        let first = job.invoke("o", &call("entropy")).await.unwrap();
        let second = job.invoke("o", &call("entropy")).await.unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_before_sandbox_exists() {
        let lab = Lab::new();
        let err = ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "lab".to_string(),
            &PermissionGrant::new().with("snap_dialog", vec![]),
            &catalog(),
            &LocalRuntime::new(lab.loader()),
            ExecutionOptions::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ExecutionError::Attenuation(_)));
    }

    #[tokio::test]
    async fn test_load_failure_fails_start() {
        let lab = Lab::new();
        let err = ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "no-such-source".to_string(),
            &PermissionGrant::new(),
            &catalog(),
            &LocalRuntime::new(lab.loader()),
            ExecutionOptions::default(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code(), codes::INTERNAL);
    }

    #[tokio::test]
    async fn test_calls_are_serialized_in_order() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;

        let first = {
            let job = job.clone();
            tokio::spawn(async move { job.invoke("o", &wait("a")).await })
        };
        lab.entered.notified().await;
        let second = {
            let job = job.clone();
            tokio::spawn(async move { job.invoke("o", &wait("b")).await })
        };
        wait_until(|| job.in_flight() == 2).await;
        assert_eq!(job.state(), JobState::Executing);

        lab.gate.add_permits(2);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(lab.log(), vec!["start:a", "end:a", "start:b", "end:b"]);
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_job_alive() {
        let lab = Lab::new();
        let options = ExecutionOptions {
            max_request_time: Duration::from_millis(100),
            ..ExecutionOptions::default()
        };
        let job = start_with(&lab, PermissionGrant::new(), options).await;
        let err = job.invoke("o", &call("hang")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { ref command, .. } if command == "snapRpc"));
        assert!(job.is_live());
        assert!(job.invoke("o", &call("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_error_resilient_mode() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        let err = job.invoke("o", &call("fail")).await.unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL);
        assert_eq!(job.state(), JobState::Ready);
    }

    #[tokio::test]
    async fn test_handler_error_exit_on_error_mode() {
        let lab = Lab::new();
        let options = ExecutionOptions {
            runtime_mode: RuntimeMode::ExitOnError,
            ..ExecutionOptions::default()
        };
        let job = start_with(&lab, PermissionGrant::new(), options).await;
        let err = job.invoke("o", &call("fail")).await.unwrap_err();
        assert_eq!(err.code(), codes::INTERNAL);
        assert_eq!(job.state(), JobState::Terminated(None));
    }

    #[tokio::test]
    async fn test_panic_is_a_fatal_fault() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        assert!(job.invoke("o", &call("panic")).await.is_err());
        wait_until(|| !job.is_live()).await;
        match job.state() {
            JobState::Terminated(Some(reason)) => assert!(reason.contains("unhandled error")),
            other => panic!("expected faulted job, got {other:?}"),
        }

        let err = job.invoke("o", &call("hello")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Terminated { .. }));
    }

    #[tokio::test]
    async fn test_terminate_rejects_later_calls() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        job.terminate().await;
        assert_eq!(job.state(), JobState::Terminated(None));
        // Idempotent.
        job.terminate().await;

        let err = job.invoke("o", &call("hello")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Terminated { .. }));
    }

    #[tokio::test]
    async fn test_terminate_rejects_pending_call() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        let pending = {
            let job = job.clone();
            tokio::spawn(async move { job.invoke("o", &call("hang")).await })
        };
        wait_until(|| job.state() == JobState::Executing).await;

        job.terminate().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_retire_waits_for_in_flight_calls() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        let pending = {
            let job = job.clone();
            tokio::spawn(async move { job.invoke("o", &wait("a")).await })
        };
        lab.entered.notified().await;

        job.retire();
        assert!(job.is_retired());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(job.is_live());

        lab.gate.add_permits(1);
        assert_eq!(pending.await.unwrap().unwrap(), json!("done"));
        wait_until(|| !job.is_live()).await;
        wait_until(|| job.state() == JobState::Terminated(None)).await;
    }

    #[tokio::test]
    async fn test_admitted_call_counts_until_done() {
        let lab = Lab::new();
        let job = start(&lab, PermissionGrant::new()).await;
        let admitted = job.admit();
        assert_eq!(job.in_flight(), 1);

        job.retire();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(job.is_live());

        let result = admitted.invoke("o", &call("hello")).await.unwrap();
        assert_eq!(result, json!({"hello": "o"}));
        wait_until(|| job.state() == JobState::Terminated(None)).await;

        // Dropping an unused call releases it too.
        let job = start(&lab, PermissionGrant::new()).await;
        drop(job.admit());
        assert_eq!(job.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_is_a_fatal_fault() {
        let lab = Lab::new();
        let runtime = RecordingRuntime::new(lab.loader());
        let job = ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "lab".to_string(),
            &PermissionGrant::new(),
            &catalog(),
            &runtime,
            ExecutionOptions::default(),
        )
        .await
        .unwrap();
        job.invoke("o", &call("hello")).await.unwrap();

        runtime.sever();
        wait_until(|| !job.is_live()).await;
        assert!(matches!(job.state(), JobState::Terminated(Some(_))));

        let err = job.invoke("o", &call("hello")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Terminated { .. }));
    }

    #[tokio::test]
    async fn test_ping_runs_under_command_timeout() {
        let lab = Lab::new();
        let runtime = RecordingRuntime::new(lab.loader());
        runtime.mute("ping");
        let options = ExecutionOptions {
            command_timeout: Duration::from_millis(50),
            ..ExecutionOptions::default()
        };
        let err = ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "lab".to_string(),
            &PermissionGrant::new(),
            &catalog(),
            &runtime,
            options,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err,
            ExecutionError::Timeout { ref command, timeout_ms: 50, .. } if command == "ping"
        ));
    }

    /// State store whose writes park until `gate` opens.
    struct GatedStore {
        entered: Notify,
        gate: Semaphore,
        writes: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl StateStore for GatedStore {
        async fn get(&self, _snap_id: &SnapId) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn set(&self, _snap_id: &SnapId, state: Value) -> Result<()> {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| ExecutionError::Internal(e.to_string()))?;
            lock(&self.writes).push(state);
            Ok(())
        }

        async fn clear(&self, _snap_id: &SnapId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_terminate_cancels_pending_endowment_calls() {
        let lab = Lab::new();
        let store = Arc::new(GatedStore {
            entered: Notify::new(),
            gate: Semaphore::new(0),
            writes: Mutex::new(Vec::new()),
        });
        let catalog = CapabilityCatalog::with_builtins(HostHooks::new(store.clone()));
        let options = ExecutionOptions {
            termination_timeout: Duration::from_millis(100),
            ..ExecutionOptions::default()
        };
        let job = ExecutionJob::start(
            SnapId::from("local:my-snap"),
            "lab".to_string(),
            &PermissionGrant::new().with(MANAGE_STATE, vec![]),
            &catalog,
            &LocalRuntime::new(lab.loader()),
            options,
        )
        .await
        .unwrap();

        let pending = {
            let job = job.clone();
            let mut request = call("state");
            request.request["params"] = json!({"late": true});
            tokio::spawn(async move { job.invoke("o", &request).await })
        };
        store.entered.notified().await;

        job.terminate().await;
        assert!(pending.await.unwrap().is_err());

        store.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lock(&store.writes).is_empty());
    }
}
