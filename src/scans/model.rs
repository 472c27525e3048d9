//! Scan job model: lifecycle states, scan options, and the job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::devices::model::ChangeSet;

/// Scope value that targets every location.
pub const ALL_SCOPES: &str = "all";

const MAX_SCOPE_LEN: usize = 128;
const MAX_CUSTOM_PORTS: usize = 1024;
const MAX_HOST_TIMEOUT_SECS: u32 = 300;

/// State of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Job exists; the start command has not been delivered yet.
    Pending,
    /// Worker accepted the start command.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ScanStatus) -> bool {
        use ScanStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScanStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown scan status: {s}")),
        }
    }
}

/// Depth of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Quick,
    #[default]
    Full,
    Custom,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quick => f.write_str("quick"),
            Self::Full => f.write_str("full"),
            Self::Custom => f.write_str("custom"),
        }
    }
}

/// Extra knobs for a `custom` scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomOptions {
    /// Ports to probe on each host.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Per-host probe timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_timeout_secs: Option<u32>,
}

/// What kind of scan to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(rename = "scan_type", default)]
    pub kind: ScanKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<CustomOptions>,
}

impl ScanOptions {
    pub fn quick() -> Self {
        Self {
            kind: ScanKind::Quick,
            options: None,
        }
    }

    pub fn full() -> Self {
        Self {
            kind: ScanKind::Full,
            options: None,
        }
    }

    pub fn custom(ports: Vec<u16>, host_timeout_secs: Option<u32>) -> Self {
        Self {
            kind: ScanKind::Custom,
            options: Some(CustomOptions {
                ports,
                host_timeout_secs,
            }),
        }
    }

    /// Reject malformed options before any job is created.
    pub fn validate(&self) -> Result<(), String> {
        match (self.kind, &self.options) {
            (ScanKind::Quick | ScanKind::Full, Some(_)) => {
                Err(format!("{} scans do not take custom options", self.kind))
            }
            (ScanKind::Quick | ScanKind::Full, None) => Ok(()),
            (ScanKind::Custom, None) => Err("custom scans require options".to_string()),
            (ScanKind::Custom, Some(custom)) => {
                if custom.ports.is_empty() {
                    return Err("custom scans require at least one port".to_string());
                }
                if custom.ports.len() > MAX_CUSTOM_PORTS {
                    return Err(format!(
                        "too many ports: {} > {MAX_CUSTOM_PORTS}",
                        custom.ports.len()
                    ));
                }
                if custom.ports.contains(&0) {
                    return Err("port 0 is not scannable".to_string());
                }
                if let Some(t) = custom.host_timeout_secs
                    && !(1..=MAX_HOST_TIMEOUT_SECS).contains(&t)
                {
                    return Err(format!(
                        "host_timeout_secs must be within 1..={MAX_HOST_TIMEOUT_SECS}"
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Validate a scope identifier (`"all"` or a location id).
pub fn validate_scope(scope: &str) -> Result<(), String> {
    if scope.trim().is_empty() {
        return Err("location_id must not be empty".to_string());
    }
    if scope.len() > MAX_SCOPE_LEN {
        return Err(format!("location_id longer than {MAX_SCOPE_LEN} bytes"));
    }
    if scope.chars().any(char::is_control) {
        return Err("location_id contains control characters".to_string());
    }
    Ok(())
}

/// One scan of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    /// Location id, or `"all"`.
    #[serde(rename = "location_id")]
    pub scope: String,
    #[serde(flatten)]
    pub options: ScanOptions,
    pub status: ScanStatus,
    /// 0 to 100.
    pub progress: u8,
    pub devices_found: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Start or last progress report; the watchdog measures silence from here.
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// Change-set attached on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ChangeSet>,
}

impl ScanJob {
    /// Create a new pending job.
    pub fn new(scope: impl Into<String>, options: ScanOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            options,
            status: ScanStatus::Pending,
            progress: 0,
            devices_found: 0,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_activity_at: now,
            error: None,
            requested_by: None,
            result: None,
        }
    }

    pub fn with_requested_by(mut self, user_id: impl Into<String>) -> Self {
        self.requested_by = Some(user_id.into());
        self
    }

    /// Apply a status change in memory, stamping timestamps. Used by stores
    /// after their compare-and-set succeeded.
    pub fn apply_transition(&mut self, to: ScanStatus, error: Option<&str>, at: DateTime<Utc>) {
        self.status = to;
        match to {
            ScanStatus::Running => {
                self.started_at.get_or_insert(at);
                self.last_activity_at = at;
            }
            s if s.is_terminal() => self.ended_at = Some(at),
            _ => {}
        }
        if let Some(e) = error {
            self.error = Some(e.to_string());
        }
    }

    /// Time since the job last showed signs of life.
    pub fn silent_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_activity_at)
    }
}
