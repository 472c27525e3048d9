//! Scan coordinator. Owns the job lifecycle.
//!
//! Every status write goes through a compare-and-set in the store, so when
//! several paths race to end a job (cancel, completion, worker error,
//! watchdog) exactly one wins and the rest become no-ops. A scan_status
//! event is published only for the write that won.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ScanJob, ScanOptions, ScanStatus, validate_scope};
use crate::config::CoordinatorConfig;
use crate::devices::model::{ChangeSet, DeviceRecord};
use crate::devices::recognition::DeviceRecognizer;
use crate::devices::reconcile::{diff, index_by_mac};
use crate::error::{DatabaseError, ScanError, TransportError, reason};
use crate::events::bus::EventBus;
use crate::events::model::{PushEvent, Severity};
use crate::identity::Principal;
use crate::store::ScanStore;
use crate::worker::channel::WorkerChannel;
use crate::worker::protocol::{ScanReport, WorkerCommand, clamp_progress};

/// Page size when a history query names none.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Largest page a history query may ask for.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// A job changes status at most twice, so a few rounds always settle a race.
const MAX_CAS_ROUNDS: usize = 4;

pub struct ScanCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn ScanStore>,
    worker: Arc<dyn WorkerChannel>,
    bus: EventBus,
    recognizer: DeviceRecognizer,
    scope_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScanCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn ScanStore>,
        worker: Arc<dyn WorkerChannel>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            worker,
            bus,
            recognizer: DeviceRecognizer::new(),
            scope_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn worker_connected(&self) -> bool {
        self.worker.is_connected()
    }

    fn scope_lock(&self, scope: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.scope_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(scope.to_string()).or_default().clone()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Create a job for `scope` and hand it to the worker.
    ///
    /// Returns the job as it stands after delivery: `running` on success,
    /// `failed` with `worker_unreachable` when every attempt failed.
    /// Delivery failure is not an error of this call.
    pub async fn start_scan(
        &self,
        principal: &Principal,
        scope: &str,
        options: ScanOptions,
    ) -> Result<ScanJob, ScanError> {
        if !principal.can_control_scans() {
            return Err(ScanError::Forbidden {
                user: principal.user_id.clone(),
                action: "start scans",
            });
        }
        validate_scope(scope).map_err(ScanError::Validation)?;
        options.validate().map_err(ScanError::Validation)?;

        let job = {
            let lock = self.scope_lock(scope);
            let _guard = lock.lock().await;

            if let Some(active) = self.store.get_active_job(scope).await? {
                return Err(ScanError::Conflict {
                    scope: scope.to_string(),
                    active: active.id,
                });
            }

            let job = ScanJob::new(scope, options).with_requested_by(principal.user_id.as_str());
            match self.store.create_job(&job).await {
                Ok(()) => job,
                Err(DatabaseError::Constraint(_)) => {
                    let active = self
                        .store
                        .get_active_job(scope)
                        .await?
                        .map(|j| j.id)
                        .unwrap_or_else(Uuid::nil);
                    return Err(ScanError::Conflict {
                        scope: scope.to_string(),
                        active,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            scan_id = %job.id,
            scope = %job.scope,
            scan_type = %job.options.kind,
            user = %principal.user_id,
            "Scan job created"
        );
        self.bus.publish(PushEvent::scan_status(&job));

        let (to, failure) = match self.deliver(&WorkerCommand::start(&job)).await {
            Ok(()) => (ScanStatus::Running, None),
            Err(e) => {
                warn!(scan_id = %job.id, error = %e, "Start command undeliverable");
                (ScanStatus::Failed, Some(reason::WORKER_UNREACHABLE))
            }
        };

        if let Some(updated) = self.transition(job.id, ScanStatus::Pending, to, failure).await? {
            return Ok(updated);
        }
        // Cancelled while we were delivering.
        Ok(self.store.get_job(job.id).await?.unwrap_or(job))
    }

    /// Send a command with bounded retries and exponential backoff.
    async fn deliver(&self, command: &WorkerCommand) -> Result<(), TransportError> {
        let attempts = self.config.start_attempts.max(1);
        let mut last_error = TransportError::TransportUnavailable;

        for attempt in 1..=attempts {
            match self.worker.send_command(command).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(scan_id = %command.scan_id(), attempt, error = %e, "Worker send failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                let backoff = self
                    .config
                    .start_backoff
                    .saturating_mul(2u32.saturating_pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error)
    }

    /// Best-effort, fire-and-forget command.
    fn notify_worker(&self, command: WorkerCommand) {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.send_command(&command).await {
                debug!(scan_id = %command.scan_id(), error = %e, "Worker notification not delivered");
            }
        });
    }

    /// Cancel a job. Cancelling a job that already ended is a no-op that
    /// reports the job's current status.
    pub async fn cancel_scan(&self, principal: &Principal, id: Uuid) -> Result<ScanStatus, ScanError> {
        if !principal.can_control_scans() {
            return Err(ScanError::Forbidden {
                user: principal.user_id.clone(),
                action: "cancel scans",
            });
        }

        let mut notified = false;
        for _ in 0..MAX_CAS_ROUNDS {
            let job = self.store.get_job(id).await?.ok_or(ScanError::NotFound { id })?;
            if job.status.is_terminal() {
                debug!(scan_id = %id, status = %job.status, "Cancel on finished scan ignored");
                return Ok(job.status);
            }

            if !notified {
                self.notify_worker(WorkerCommand::cancel(id));
                notified = true;
            }

            if let Some(cancelled) = self
                .transition(id, job.status, ScanStatus::Cancelled, None)
                .await?
            {
                info!(scan_id = %id, user = %principal.user_id, "Scan cancelled");
                return Ok(cancelled.status);
            }
        }

        let job = self.store.get_job(id).await?.ok_or(ScanError::NotFound { id })?;
        Ok(job.status)
    }

    // ── Worker events ───────────────────────────────────────────────

    /// Record progress for a running job. Stale reports are ignored.
    pub async fn handle_progress(&self, id: Uuid, progress: f64, devices_found: u32) -> Result<(), ScanError> {
        match self
            .store
            .update_job_progress(id, clamp_progress(progress), devices_found)
            .await?
        {
            Some(job) => {
                debug!(scan_id = %id, progress = job.progress, devices_found, "Scan progress");
                self.bus.publish(PushEvent::scan_status(&job));
            }
            None => debug!(scan_id = %id, "Progress for inactive scan ignored"),
        }
        Ok(())
    }

    /// Reconcile a finished report and complete the job.
    ///
    /// Returns the change-set, or `None` when the report was discarded
    /// because the job is unknown or no longer running.
    pub async fn handle_completion(&self, report: ScanReport) -> Result<Option<ChangeSet>, ScanError> {
        let Some(job) = self.store.get_job(report.scan_id).await? else {
            warn!(scan_id = %report.scan_id, "Report for unknown scan discarded");
            return Ok(None);
        };
        if job.status != ScanStatus::Running {
            debug!(scan_id = %job.id, status = %job.status, "Report for inactive scan discarded");
            return Ok(None);
        }

        let lock = self.scope_lock(&job.scope);
        let _guard = lock.lock().await;

        let mut devices = report.devices;
        for device in &mut devices {
            self.recognizer.annotate(device);
        }

        let previous = index_by_mac(self.store.load_snapshots(&job.scope).await?);
        let changes = diff(&previous, &devices);

        let Some(done) = self.store.save_snapshots(job.id, &devices, &changes).await? else {
            debug!(scan_id = %job.id, "Scan ended before its report was saved");
            return Ok(None);
        };

        info!(
            scan_id = %done.id,
            scope = %done.scope,
            devices = devices.len(),
            new = changes.new.len(),
            changed = changes.changed.len(),
            offline = changes.offline.len(),
            "Scan completed"
        );

        self.bus.publish(PushEvent::scan_status(&done));
        for (change, device) in changes.entries() {
            self.bus.publish(PushEvent::device_status(&done.scope, change, device));
        }
        if !changes.new.is_empty() {
            self.bus.publish(PushEvent::alert(
                Severity::Warning,
                "New devices detected",
                format!("{} new device(s) on {}", changes.new.len(), done.scope),
            ));
        }

        Ok(Some(changes))
    }

    /// The worker reported that it gave up on a scan.
    pub async fn handle_failure(&self, id: Uuid, message: &str) -> Result<Option<ScanJob>, ScanError> {
        warn!(scan_id = %id, message, "Worker reported scan failure");
        self.fail_active(id, message).await
    }

    // ── Supervision ─────────────────────────────────────────────────

    /// Fail every active job that has been silent for longer than
    /// `max_silent`. Returns the number of jobs failed.
    pub async fn sweep_stalled(&self) -> Result<usize, ScanError> {
        let now = Utc::now();
        let mut failed = 0;

        for job in self.store.list_active_jobs().await? {
            let silent = job.silent_for(now).to_std().unwrap_or_default();
            if silent <= self.config.max_silent {
                continue;
            }
            warn!(scan_id = %job.id, silent_secs = silent.as_secs(), "Scan timed out");
            if self.fail_active(job.id, reason::TIMEOUT).await?.is_some() {
                failed += 1;
            }
        }

        Ok(failed)
    }

    /// Fail jobs a previous process left pending or running. Call once at
    /// startup, before the worker listener runs.
    pub async fn recover_orphans(&self) -> Result<usize, ScanError> {
        let mut recovered = 0;
        for job in self.store.list_active_jobs().await? {
            if self
                .fail_active(job.id, reason::COORDINATOR_RESTART)
                .await?
                .is_some()
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Failed scans orphaned by restart");
        }
        Ok(recovered)
    }

    async fn fail_active(&self, id: Uuid, why: &str) -> Result<Option<ScanJob>, ScanError> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(job) = self.store.get_job(id).await? else {
                debug!(scan_id = %id, "Failure for unknown scan ignored");
                return Ok(None);
            };
            if job.status.is_terminal() {
                return Ok(None);
            }
            if let Some(failed) = self
                .transition(id, job.status, ScanStatus::Failed, Some(why))
                .await?
            {
                return Ok(Some(failed));
            }
        }
        Ok(None)
    }

    /// Compare-and-set a status change and publish it if it took effect.
    async fn transition(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error: Option<&str>,
    ) -> Result<Option<ScanJob>, ScanError> {
        if !from.can_transition_to(to) {
            return Ok(None);
        }

        let Some(job) = self.store.update_job_status(id, from, to, error).await? else {
            debug!(scan_id = %id, %from, %to, "Stale transition ignored");
            return Ok(None);
        };

        debug!(scan_id = %id, %from, %to, "Scan status changed");
        self.bus.publish(PushEvent::scan_status(&job));
        if to == ScanStatus::Failed {
            self.bus.publish(PushEvent::alert(
                Severity::Error,
                "Scan failed",
                format!(
                    "Scan {} of {} failed: {}",
                    job.id,
                    job.scope,
                    job.error.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        Ok(Some(job))
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_job(&self, id: Uuid) -> Result<ScanJob, ScanError> {
        self.store.get_job(id).await?.ok_or(ScanError::NotFound { id })
    }

    /// Newest first. `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    pub async fn list_jobs(
        &self,
        scope: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<ScanJob>, ScanError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.list_jobs(scope, limit, offset).await?)
    }

    /// The change-set of a completed job.
    pub async fn job_result(&self, id: Uuid) -> Result<ChangeSet, ScanError> {
        let job = self.get_job(id).await?;
        match (job.status, job.result) {
            (ScanStatus::Completed, Some(result)) => Ok(result),
            (status, _) => Err(ScanError::NoResult {
                id,
                status: status.to_string(),
            }),
        }
    }

    pub async fn devices(&self, scope: Option<&str>) -> Result<Vec<DeviceRecord>, ScanError> {
        Ok(self.store.list_devices(scope).await?)
    }
}
