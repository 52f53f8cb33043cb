//! Job registry and request router.
//!
//! One job slot per snap. A slot is a `tokio::sync::Mutex` held only while
//! a job is being started or swapped, so concurrent first calls for the same
//! snap share one start and calls to different snaps never wait on each
//! other. Every request goes through the admission queue first; the permit
//! is released on every outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AdmittedCall, ExecutionJob, ExecutionOptions, JobState, PermissionSource, SnapSource};
use crate::admission::RequestQueue;
use crate::capability::CapabilityCatalog;
use crate::error::{ExecutionError, Result};
use crate::lock;
use crate::runtime::SandboxRuntime;
use crate::snap::{SnapId, SnapRequest};

type JobSlot = Arc<tokio::sync::Mutex<Option<Arc<ExecutionJob>>>>;

pub struct ExecutionService {
    runtime: Arc<dyn SandboxRuntime>,
    catalog: CapabilityCatalog,
    permissions: Arc<dyn PermissionSource>,
    sources: Arc<dyn SnapSource>,
    queue: RequestQueue,
    options: ExecutionOptions,
    jobs: Mutex<HashMap<SnapId, JobSlot>>,
}

impl ExecutionService {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        catalog: CapabilityCatalog,
        permissions: Arc<dyn PermissionSource>,
        sources: Arc<dyn SnapSource>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            runtime,
            catalog,
            permissions,
            sources,
            queue: RequestQueue::new(options.max_queue_size),
            options,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Routes one request from `origin` to the snap's job, starting the
    /// job if there is none (or the last one died).
    pub async fn handle_request(
        &self,
        origin: &str,
        snap_id: &SnapId,
        request: SnapRequest,
    ) -> Result<Value> {
        if self.permissions.grant(snap_id).is_none() {
            return Err(ExecutionError::SnapNotFound(snap_id.to_string()));
        }
        if !self.permissions.can_invoke(origin, snap_id) {
            warn!(origin, snap = %snap_id, "origin not allowed to call snap");
            return Err(ExecutionError::Unauthorized {
                origin: origin.to_string(),
                snap_id: snap_id.to_string(),
            });
        }
        let _permit = self.queue.admit(origin)?;

        let call = self.job_for(snap_id).await?;
        call.invoke(origin, &request).await
    }

    /// Starts the snap's job if it is not already running.
    /// Returns the job id.
    pub async fn execute_snap(&self, snap_id: &SnapId) -> Result<String> {
        let call = self.job_for(snap_id).await?;
        Ok(call.job().id().to_string())
    }

    /// Stops the snap's job. Returns false if nothing was running.
    pub async fn terminate_snap(&self, snap_id: &SnapId) -> bool {
        let Some(slot) = self.slot_if_exists(snap_id) else {
            return false;
        };
        let job = slot.lock().await.take();
        match job {
            Some(job) => {
                job.terminate().await;
                true
            }
            None => false,
        }
    }

    pub async fn terminate_all(&self) {
        let slots: Vec<JobSlot> = lock(&self.jobs).values().cloned().collect();
        let mut jobs = Vec::new();
        for slot in slots {
            if let Some(job) = slot.lock().await.take() {
                jobs.push(job);
            }
        }
        let count = jobs.len();
        futures::future::join_all(jobs.iter().map(|job| job.terminate())).await;
        info!(count, "all jobs terminated");
    }

    /// The snap's current job, if any. A slot busy starting a job has none yet.
    pub fn job(&self, snap_id: &SnapId) -> Option<Arc<ExecutionJob>> {
        let slot = self.slot_if_exists(snap_id)?;
        let current = slot.try_lock().ok()?;
        current.clone()
    }

    pub fn job_state(&self, snap_id: &SnapId) -> Option<JobState> {
        let slot = self.slot_if_exists(snap_id)?;
        let state = match slot.try_lock() {
            Ok(current) => current.as_ref().map(|job| job.state()),
            Err(_) => Some(JobState::Starting),
        };
        state
    }

    /// Snaps with a live job, sorted.
    pub fn running_snaps(&self) -> Vec<SnapId> {
        let slots: Vec<(SnapId, JobSlot)> = lock(&self.jobs)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut running: Vec<SnapId> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map(|current| current.as_ref().is_some_and(|job| job.is_live()))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id)
            .collect();
        running.sort();
        running
    }

    /// Swaps the snap's job for one started under the current grant.
    ///
    /// Calls already dispatched to the old job finish under the old grant;
    /// the old job stops once they have drained.
    pub async fn on_grant_changed(&self, snap_id: &SnapId) {
        let Some(slot) = self.slot_if_exists(snap_id) else {
            return;
        };
        let mut current = slot.lock().await;
        let Some(old) = current.take() else {
            return;
        };
        if !old.is_live() {
            return;
        }
        info!(snap = %snap_id, job = %old.id(), "grant changed, restarting job");
        old.retire();
        match self.start_job(snap_id).await {
            Ok(job) => *current = Some(job),
            Err(e) => warn!(snap = %snap_id, "restart after grant change failed: {e}"),
        }
    }

    /// Restarts jobs whenever the permission source signals a grant change.
    pub fn watch_permissions(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.permissions.subscribe();
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let changed = match changes.recv().await {
                    Ok(snap_id) => vec![snap_id],
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "missed grant changes, restarting every running job");
                        match service.upgrade() {
                            Some(service) => service.running_snaps(),
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                for snap_id in changed {
                    service.on_grant_changed(&snap_id).await;
                }
            }
            debug!("permission watcher stopped");
        })
    }

    fn slot(&self, snap_id: &SnapId) -> JobSlot {
        lock(&self.jobs).entry(snap_id.clone()).or_default().clone()
    }

    fn slot_if_exists(&self, snap_id: &SnapId) -> Option<JobSlot> {
        lock(&self.jobs).get(snap_id).cloned()
    }

    /// Admits a call on the snap's job while its slot is locked, so the job
    /// cannot be retired between lookup and admission.
    async fn job_for(&self, snap_id: &SnapId) -> Result<AdmittedCall> {
        let slot = self.slot(snap_id);
        let mut current = slot.lock().await;
        if let Some(job) = current.as_ref() {
            if job.is_live() && !job.is_retired() {
                return Ok(job.admit());
            }
            debug!(snap = %snap_id, job = %job.id(), state = %job.state(), "replacing dead job");
        }
        let job = self.start_job(snap_id).await?;
        let call = job.admit();
        *current = Some(job);
        Ok(call)
    }

    async fn start_job(&self, snap_id: &SnapId) -> Result<Arc<ExecutionJob>> {
        let source = self
            .sources
            .source(snap_id)
            .ok_or_else(|| ExecutionError::SnapNotFound(snap_id.to_string()))?;
        let grant = self
            .permissions
            .grant(snap_id)
            .ok_or_else(|| ExecutionError::SnapNotFound(snap_id.to_string()))?;
        ExecutionJob::start(
            snap_id.clone(),
            source,
            &grant,
            &self.catalog,
            self.runtime.as_ref(),
            self.options.clone(),
        )
        .await
    }
}
