//! `ScanStore`, the single async interface for scan job and device persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::devices::model::{ChangeSet, DeviceRecord, DeviceSnapshot};
use crate::error::DatabaseError;
use crate::scans::model::{ScanJob, ScanStatus};

/// Backend-agnostic store for scan jobs and device snapshots.
///
/// Every status write is a compare-and-set against the expected current
/// status: the first terminal write for a job wins and later ones report
/// `None` without touching the row.
#[async_trait]
pub trait ScanStore: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job.
    ///
    /// Fails with `DatabaseError::Constraint` when the scope already has a
    /// pending or running job; the check and the insert are one atomic step.
    async fn create_job(&self, job: &ScanJob) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError>;

    /// The pending or running job of a scope, if any.
    async fn get_active_job(&self, scope: &str) -> Result<Option<ScanJob>, DatabaseError>;

    /// Every pending or running job, oldest first.
    async fn list_active_jobs(&self) -> Result<Vec<ScanJob>, DatabaseError>;

    /// Jobs newest first, optionally filtered by scope.
    async fn list_jobs(
        &self,
        scope: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScanJob>, DatabaseError>;

    /// Move a job from `from` to `to`. Returns the updated job, or `None` if
    /// the job was not in `from` (or does not exist).
    async fn update_job_status(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error: Option<&str>,
    ) -> Result<Option<ScanJob>, DatabaseError>;

    /// Record progress on a running job and refresh its activity timestamp.
    /// Returns `None` if the job is not running.
    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: u8,
        devices_found: u32,
    ) -> Result<Option<ScanJob>, DatabaseError>;

    // ── Devices ─────────────────────────────────────────────────────

    /// Devices of a scope currently marked online, sorted by MAC.
    async fn load_snapshots(&self, scope: &str) -> Result<Vec<DeviceSnapshot>, DatabaseError>;

    /// Every stored device, optionally filtered by scope.
    async fn list_devices(&self, scope: Option<&str>) -> Result<Vec<DeviceRecord>, DatabaseError>;

    /// Persist a finished scan in one atomic step: the job moves
    /// running → completed with `changes` attached, every reported device is
    /// upserted online, and every `changes.offline` device is marked offline.
    ///
    /// Returns `None` and writes nothing if the job is no longer running.
    async fn save_snapshots(
        &self,
        id: Uuid,
        report: &[DeviceSnapshot],
        changes: &ChangeSet,
    ) -> Result<Option<ScanJob>, DatabaseError>;
}
