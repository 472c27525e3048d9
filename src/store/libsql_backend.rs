//! libSQL backend for `ScanStore`.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; writes are serialized through `write_lock` so
//! each compare-and-set reads and writes without interleaving.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::devices::model::{ChangeSet, DeviceKind, DeviceRecord, DeviceSnapshot, MacAddress};
use crate::error::DatabaseError;
use crate::scans::model::{CustomOptions, ScanJob, ScanKind, ScanOptions, ScanStatus};
use crate::store::migrations;
use crate::store::traits::ScanStore;

/// libSQL database backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<ScanJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn kind_to_str(kind: ScanKind) -> &'static str {
    match kind {
        ScanKind::Quick => "quick",
        ScanKind::Full => "full",
        ScanKind::Custom => "custom",
    }
}

fn str_to_kind(s: &str) -> ScanKind {
    match s {
        "quick" => ScanKind::Quick,
        "custom" => ScanKind::Custom,
        _ => ScanKind::Full,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

const JOB_COLUMNS: &str = "id, scope, scan_type, options, status, progress, devices_found, created_at, started_at, ended_at, last_activity_at, error, requested_by, result";

const DEVICE_COLUMNS: &str = "scope, mac, ip, hostname, device_type, vendor, services, last_seen, online";

/// Map a libsql Row to a ScanJob. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<ScanJob, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_job: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let options_str: Option<String> = row.get(3).ok();
    let status_str: String = row.get(4).map_err(get_err)?;
    let progress: i64 = row.get(5).map_err(get_err)?;
    let devices_found: i64 = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(7).map_err(get_err)?;
    let started_str: Option<String> = row.get(8).ok();
    let ended_str: Option<String> = row.get(9).ok();
    let activity_str: String = row.get(10).map_err(get_err)?;
    let result_str: Option<String> = row.get(13).ok();

    let options: Option<CustomOptions> = match options_str {
        Some(s) => Some(
            serde_json::from_str(&s).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        ),
        None => None,
    };
    let result: Option<ChangeSet> = match result_str {
        Some(s) => Some(
            serde_json::from_str(&s).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        ),
        None => None,
    };

    Ok(ScanJob {
        id: Uuid::parse_str(&id_str).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        scope: row.get(1).map_err(get_err)?,
        options: ScanOptions {
            kind: str_to_kind(&kind_str),
            options,
        },
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        progress: progress.clamp(0, 100) as u8,
        devices_found: devices_found.max(0) as u32,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        ended_at: parse_optional_datetime(&ended_str),
        last_activity_at: parse_datetime(&activity_str),
        error: row.get(11).ok(),
        requested_by: row.get(12).ok(),
        result,
    })
}

/// Map a libsql Row to a DeviceRecord. Column order matches DEVICE_COLUMNS.
fn row_to_device(row: &libsql::Row) -> Result<DeviceRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_device: {e}"));

    let mac_str: String = row.get(1).map_err(get_err)?;
    let ip_str: String = row.get(2).map_err(get_err)?;
    let kind_str: String = row.get(4).map_err(get_err)?;
    let services_str: String = row.get(6).map_err(get_err)?;
    let last_seen_str: String = row.get(7).map_err(get_err)?;
    let online: i64 = row.get(8).map_err(get_err)?;

    let snapshot = DeviceSnapshot {
        mac: MacAddress::parse(&mac_str).map_err(DatabaseError::Serialization)?,
        ip: ip_str
            .parse()
            .map_err(|e: std::net::AddrParseError| DatabaseError::Serialization(e.to_string()))?,
        hostname: row.get(3).ok(),
        kind: kind_str.parse().unwrap_or(DeviceKind::Unknown),
        vendor: row.get(5).ok(),
        services: serde_json::from_str(&services_str)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        last_seen: parse_datetime(&last_seen_str),
    };

    Ok(DeviceRecord {
        scope: row.get(0).map_err(get_err)?,
        snapshot,
        online: online != 0,
    })
}

/// Write every mutable job column, guarded by the expected current status.
/// Returns the number of rows changed (0 when the guard failed).
async fn write_job_state(
    conn: &Connection,
    job: &ScanJob,
    expected: ScanStatus,
) -> Result<u64, DatabaseError> {
    let result = match &job.result {
        Some(changes) => Some(to_json(changes)?),
        None => None,
    };
    conn.execute(
        "UPDATE scan_jobs SET status = ?1, progress = ?2, devices_found = ?3, started_at = ?4,
             ended_at = ?5, last_activity_at = ?6, error = ?7, result = ?8
         WHERE id = ?9 AND status = ?10",
        params![
            job.status.as_str(),
            i64::from(job.progress),
            i64::from(job.devices_found),
            opt_text(job.started_at.map(|t| t.to_rfc3339())),
            opt_text(job.ended_at.map(|t| t.to_rfc3339())),
            job.last_activity_at.to_rfc3339(),
            opt_text(job.error.clone()),
            opt_text(result),
            job.id.to_string(),
            expected.as_str()
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("write_job_state: {e}")))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ScanStore for LibSqlStore {
    async fn create_job(&self, job: &ScanJob) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let options = match &job.options.options {
            Some(custom) => Some(to_json(custom)?),
            None => None,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO scan_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL)"
                ),
                params![
                    job.id.to_string(),
                    job.scope.clone(),
                    kind_to_str(job.options.kind),
                    opt_text(options),
                    job.status.as_str(),
                    i64::from(job.progress),
                    i64::from(job.devices_found),
                    job.created_at.to_rfc3339(),
                    opt_text(job.started_at.map(|t| t.to_rfc3339())),
                    opt_text(job.ended_at.map(|t| t.to_rfc3339())),
                    job.last_activity_at.to_rfc3339(),
                    opt_text(job.error.clone()),
                    opt_text(job.requested_by.clone())
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("scope {} already has an active job", job.scope))
                } else {
                    DatabaseError::Query(format!("create_job: {e}"))
                }
            })?;

        debug!(job_id = %job.id, scope = %job.scope, "Scan job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScanJob>, DatabaseError> {
        let jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn get_active_job(&self, scope: &str) -> Result<Option<ScanJob>, DatabaseError> {
        let jobs = self
            .query_jobs(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scan_jobs
                     WHERE scope = ?1 AND status IN ('pending', 'running') LIMIT 1"
                ),
                params![scope],
                "get_active_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_active_jobs(&self) -> Result<Vec<ScanJob>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM scan_jobs
                 WHERE status IN ('pending', 'running') ORDER BY created_at ASC"
            ),
            (),
            "list_active_jobs",
        )
        .await
    }

    async fn list_jobs(
        &self,
        scope: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScanJob>, DatabaseError> {
        let limit = limit as i64;
        let offset = offset as i64;
        match scope {
            Some(scope) => {
                self.query_jobs(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE scope = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
                    ),
                    params![scope, limit, offset],
                    "list_jobs",
                )
                .await
            }
            None => {
                self.query_jobs(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM scan_jobs
                         ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
                    ),
                    params![limit, offset],
                    "list_jobs",
                )
                .await
            }
        }
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        from: ScanStatus,
        to: ScanStatus,
        error: Option<&str>,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut job) = self.get_job(id).await? else {
            return Ok(None);
        };
        if job.status != from {
            return Ok(None);
        }

        job.apply_transition(to, error, Utc::now());
        if write_job_state(self.conn(), &job, from).await? == 0 {
            return Ok(None);
        }

        debug!(job_id = %id, %from, %to, "Scan job status updated in DB");
        Ok(Some(job))
    }

    async fn update_job_progress(
        &self,
        id: Uuid,
        progress: u8,
        devices_found: u32,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut job) = self.get_job(id).await? else {
            return Ok(None);
        };
        if job.status != ScanStatus::Running {
            return Ok(None);
        }

        job.progress = progress.min(100);
        job.devices_found = devices_found;
        job.last_activity_at = Utc::now();
        if write_job_state(self.conn(), &job, ScanStatus::Running).await? == 0 {
            return Ok(None);
        }
        Ok(Some(job))
    }

    async fn load_snapshots(&self, scope: &str) -> Result<Vec<DeviceSnapshot>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE scope = ?1 AND online = 1 ORDER BY mac"
                ),
                params![scope],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_snapshots: {e}")))?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_snapshots: {e}")))?
        {
            snapshots.push(row_to_device(&row)?.snapshot);
        }
        Ok(snapshots)
    }

    async fn list_devices(&self, scope: Option<&str>) -> Result<Vec<DeviceRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match scope {
            Some(scope) => {
                conn.query(
                    &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE scope = ?1 ORDER BY scope, mac"),
                    params![scope],
                )
                .await
            }
            None => {
                conn.query(
                    &format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY scope, mac"),
                    (),
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_devices: {e}")))?;

        let mut devices = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_devices: {e}")))?
        {
            devices.push(row_to_device(&row)?);
        }
        Ok(devices)
    }

    async fn save_snapshots(
        &self,
        id: Uuid,
        report: &[DeviceSnapshot],
        changes: &ChangeSet,
    ) -> Result<Option<ScanJob>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut job) = self.get_job(id).await? else {
            return Ok(None);
        };
        if job.status != ScanStatus::Running {
            return Ok(None);
        }

        let now = Utc::now();
        job.apply_transition(ScanStatus::Completed, None, now);
        job.progress = 100;
        job.devices_found = report.len() as u32;
        job.result = Some(changes.clone());

        // Dropping the transaction without commit rolls it back.
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_snapshots: begin: {e}")))?;

        if write_job_state(&tx, &job, ScanStatus::Running).await? == 0 {
            return Ok(None);
        }

        for device in report {
            tx.execute(
                &format!(
                    "INSERT INTO devices ({DEVICE_COLUMNS}, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
                     ON CONFLICT(scope, mac) DO UPDATE SET
                         ip = excluded.ip, hostname = excluded.hostname,
                         device_type = excluded.device_type, vendor = excluded.vendor,
                         services = excluded.services, last_seen = excluded.last_seen,
                         online = 1, updated_at = excluded.updated_at"
                ),
                params![
                    job.scope.clone(),
                    device.mac.as_str(),
                    device.ip.to_string(),
                    opt_text(device.hostname.clone()),
                    device.kind.to_string(),
                    opt_text(device.vendor.clone()),
                    to_json(&device.services)?,
                    device.last_seen.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_snapshots: upsert: {e}")))?;
        }

        for device in &changes.offline {
            tx.execute(
                "UPDATE devices SET online = 0, updated_at = ?1 WHERE scope = ?2 AND mac = ?3",
                params![now.to_rfc3339(), job.scope.clone(), device.mac.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_snapshots: offline: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_snapshots: commit: {e}")))?;

        debug!(
            job_id = %id,
            new = changes.new.len(),
            changed = changes.changed.len(),
            offline = changes.offline.len(),
            "Scan snapshots saved"
        );
        Ok(Some(job))
    }
}
