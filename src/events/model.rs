//! Push event model, i.e. what travels over `/ws` to clients.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::devices::model::{DeviceChange, DeviceKind, DeviceSnapshot, MacAddress, ServiceEntry};
use crate::scans::model::{ScanJob, ScanStatus};

/// Event category a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    ScanStatus,
    DeviceStatus,
    #[serde(alias = "alerts")]
    Alert,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanStatus => f.write_str("scan_status"),
            Self::DeviceStatus => f.write_str("device_status"),
            Self::Alert => f.write_str("alert"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Progress or state change of one scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatusData {
    pub scan_id: Uuid,
    pub location_id: String,
    pub status: ScanStatus,
    pub progress: u8,
    pub devices_found: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ScanJob> for ScanStatusData {
    fn from(job: &ScanJob) -> Self {
        Self {
            scan_id: job.id,
            location_id: job.scope.clone(),
            status: job.status,
            progress: job.progress,
            devices_found: job.devices_found,
            error: job.error.clone(),
        }
    }
}

/// One device that appeared, changed, or went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusData {
    pub mac: MacAddress,
    pub ip: IpAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    pub status: DeviceChange,
    #[serde(default)]
    pub services: BTreeSet<ServiceEntry>,
    #[serde(default)]
    pub device_type: DeviceKind,
    pub location_id: String,
}

impl DeviceStatusData {
    pub fn new(scope: &str, change: DeviceChange, device: &DeviceSnapshot) -> Self {
        Self {
            mac: device.mac.clone(),
            ip: device.ip,
            hostname: device.hostname.clone(),
            status: change,
            services: device.services.clone(),
            device_type: device.kind,
            location_id: scope.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertData {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

/// A message pushed to subscribed clients.
///
/// Wire shape: `{"type": "<topic>", "data": {...}, "timestamp": "<rfc3339>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    ScanStatus {
        data: ScanStatusData,
        timestamp: DateTime<Utc>,
    },
    DeviceStatus {
        data: DeviceStatusData,
        timestamp: DateTime<Utc>,
    },
    Alert {
        data: AlertData,
        timestamp: DateTime<Utc>,
    },
}

impl PushEvent {
    pub fn scan_status(job: &ScanJob) -> Self {
        Self::ScanStatus {
            data: job.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn device_status(scope: &str, change: DeviceChange, device: &DeviceSnapshot) -> Self {
        Self::DeviceStatus {
            data: DeviceStatusData::new(scope, change, device),
            timestamp: Utc::now(),
        }
    }

    pub fn alert(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Alert {
            data: AlertData {
                severity,
                title: title.into(),
                message: message.into(),
            },
            timestamp: Utc::now(),
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Self::ScanStatus { .. } => Topic::ScanStatus,
            Self::DeviceStatus { .. } => Topic::DeviceStatus,
            Self::Alert { .. } => Topic::Alert,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ScanStatus { timestamp, .. }
            | Self::DeviceStatus { timestamp, .. }
            | Self::Alert { timestamp, .. } => *timestamp,
        }
    }
}

/// Messages a push client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topics: Vec<Topic> },
    Unsubscribe { topics: Vec<Topic> },
}
