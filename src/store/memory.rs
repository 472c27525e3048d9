//! In-memory `ScanStore`, used for `:memory:` deployments and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::devices::model::{ChangeSet, DeviceRecord, DeviceSnapshot, MacAddress};
use crate::error::DatabaseError;
use crate::scans::model::{ScanJob, ScanStatus};
use crate::store::traits::ScanStore;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, ScanJob>,
    devices: BTreeMap<(String, MacAddress), DeviceRecord>,
}

/// Jobs and devices behind a single lock, so multi-row writes are atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_job(&self, job: &ScanJob) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if let Some(active) = state
            .jobs
            .values()
            .find(|j| j.scope == job.scope && j.status.is_active())
        {
            return Err(DatabaseError::Constraint(format!(
                "scope {} already has active job {}",
                job.scope, active.id
            )));
        }
        if state.jobs.contains_key(&job.id) {
            return Err(DatabaseError::Constraint(format!("duplicate job id {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn get_active_job(&self, scope: &str) -> Result<Option<ScanJob>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .find(|j| j.scope == scope && j.status.is_active())
            .cloned())
    }

    async fn list_active_jobs(&self) -> Result<Vec<ScanJob>, DatabaseError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_jobs(
        &self,
        scope: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScanJob>, DatabaseError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|j| scope.is_none_or(|s| j.scope == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error: Option<&str>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == from => {
                job.apply_transition(to, error, Utc::now());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: u8,
        devices_found: u32,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == ScanStatus::Running => {
                job.progress = progress.min(100);
                job.devices_found = devices_found;
                job.last_activity_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn load_snapshots(&self, scope: &str) -> Result<Vec<DeviceSnapshot>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .devices
            .values()
            .filter(|r| r.scope == scope && r.online)
            .map(|r| r.snapshot.clone())
            .collect())
    }

    async fn list_devices(&self, scope: Option<&str>) -> Result<Vec<DeviceRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .devices
            .values()
            .filter(|r| scope.is_none_or(|s| r.scope == s))
            .cloned()
            .collect())
    }

    async fn save_snapshots(
        &self,
        id: Uuid,
        report: &[DeviceSnapshot],
        changes: &ChangeSet,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let scope = match state.jobs.get_mut(&id) {
            Some(job) if job.status == ScanStatus::Running => {
                job.apply_transition(ScanStatus::Completed, None, now);
                job.progress = 100;
                job.devices_found = report.len() as u32;
                job.result = Some(changes.clone());
                job.scope.clone()
            }
            _ => return Ok(None),
        };

        for device in report {
            state.devices.insert(
                (scope.clone(), device.mac.clone()),
                DeviceRecord {
                    scope: scope.clone(),
                    snapshot: device.clone(),
                    online: true,
                },
            );
        }
        for device in &changes.offline {
            if let Some(record) = state.devices.get_mut(&(scope.clone(), device.mac.clone())) {
                record.online = false;
            }
        }

        Ok(state.jobs.get(&id).cloned())
    }
}
