//! Control-link messages exchanged with the scanning worker.
//!
//! Both directions use `{"type": "...", "data": {...}}` frames.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::devices::model::DeviceSnapshot;
use crate::scans::model::{CustomOptions, ScanJob, ScanKind};

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerCommand {
    StartScan {
        scan_id: Uuid,
        location_id: String,
        scan_type: ScanKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<CustomOptions>,
    },
    CancelScan {
        scan_id: Uuid,
    },
}

impl WorkerCommand {
    pub fn start(job: &ScanJob) -> Self {
        Self::StartScan {
            scan_id: job.id,
            location_id: job.scope.clone(),
            scan_type: job.options.kind,
            options: job.options.options.clone(),
        }
    }

    pub fn cancel(scan_id: Uuid) -> Self {
        Self::CancelScan { scan_id }
    }

    pub fn scan_id(&self) -> Uuid {
        match self {
            Self::StartScan { scan_id, .. } | Self::CancelScan { scan_id } => *scan_id,
        }
    }
}

/// The full device list a worker reports when a scan finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    /// Entries that fail to parse are logged and skipped.
    #[serde(default, deserialize_with = "lenient_devices")]
    pub devices: Vec<DeviceSnapshot>,
}

fn lenient_devices<'de, D>(deserializer: D) -> Result<Vec<DeviceSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(device) => Some(device),
            Err(e) => {
                warn!(error = %e, entry = %entry, "Skipping malformed device in report");
                None
            }
        })
        .collect())
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Periodic progress; `progress` is a percentage and may be fractional.
    Progress {
        scan_id: Uuid,
        progress: f64,
        #[serde(default)]
        devices_found: u32,
    },
    Report(ScanReport),
    /// Acknowledges a command; informational only.
    Ack {
        scan_id: Uuid,
        #[serde(default)]
        command: String,
    },
    /// The worker gave up on a scan.
    Error {
        scan_id: Uuid,
        message: String,
    },
}

impl WorkerEvent {
    pub fn scan_id(&self) -> Uuid {
        match self {
            Self::Progress { scan_id, .. }
            | Self::Ack { scan_id, .. }
            | Self::Error { scan_id, .. } => *scan_id,
            Self::Report(report) => report.scan_id,
        }
    }

    /// Parse one text frame. Unrecognized shapes are logged and dropped.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, text = text, "Unrecognized worker message");
                None
            }
        }
    }
}

/// Clamp a reported percentage into `0..=100`.
pub fn clamp_progress(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scans::model::ScanOptions;

    #[test]
    fn start_command_wire_shape() {
        let job = ScanJob::new("L1", ScanOptions::custom(vec![22], None));
        let json = serde_json::to_value(WorkerCommand::start(&job)).unwrap();
        assert_eq!(json["type"], "start_scan");
        assert_eq!(json["data"]["location_id"], "L1");
        assert_eq!(json["data"]["scan_type"], "custom");
        assert_eq!(json["data"]["options"]["ports"][0], 22);

        let quick = ScanJob::new("L1", ScanOptions::quick());
        let json = serde_json::to_value(WorkerCommand::start(&quick)).unwrap();
        assert!(json["data"].get("options").is_none());
    }

    #[test]
    fn parses_worker_events() {
        let id = Uuid::new_v4();
        let progress = WorkerEvent::parse(&format!(
            r#"{{"type":"progress","data":{{"scan_id":"{id}","progress":42.6,"devices_found":3}}}}"#
        ))
        .unwrap();
        assert_eq!(progress.scan_id(), id);

        let report = WorkerEvent::parse(&format!(
            r#"{{"type":"report","data":{{"scan_id":"{id}","devices":[
                {{"mac":"AA:BB:CC:DD:EE:FF","ip":"10.0.0.9","ports":[]}}
            ]}}}}"#
        ))
        .unwrap();
        match report {
            WorkerEvent::Report(r) => assert_eq!(r.devices[0].mac.as_str(), "aa:bb:cc:dd:ee:ff"),
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn malformed_device_is_skipped_not_the_report() {
        let id = Uuid::new_v4();
        let event = WorkerEvent::parse(&format!(
            r#"{{"type":"report","data":{{"scan_id":"{id}","devices":[
                {{"mac":"not-a-mac","ip":"10.0.0.1"}},
                {{"mac":"AA:BB:CC:DD:EE:01","ip":"10.0.0.300"}},
                {{"mac":"AA:BB:CC:DD:EE:02","ip":"10.0.0.2"}}
            ]}}}}"#
        ))
        .unwrap();
        match event {
            WorkerEvent::Report(r) => {
                assert_eq!(r.scan_id, id);
                assert_eq!(r.devices.len(), 1);
                assert_eq!(r.devices[0].mac.as_str(), "aa:bb:cc:dd:ee:02");
            }
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_dropped() {
        assert!(WorkerEvent::parse("not json").is_none());
        assert!(WorkerEvent::parse(r#"{"type":"reboot","data":{}}"#).is_none());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(42.6), 43);
        assert_eq!(clamp_progress(-5.0), 0);
        assert_eq!(clamp_progress(250.0), 100);
        assert_eq!(clamp_progress(f64::NAN), 0);
    }
}
