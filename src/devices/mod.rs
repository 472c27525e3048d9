//! Devices: snapshot model, recognition and the reconciliation engine.

pub mod model;
pub mod recognition;
pub mod reconcile;

pub use model::{ChangeSet, DeviceChange, DeviceKind, DeviceRecord, DeviceSnapshot, MacAddress, ServiceEntry};
pub use recognition::DeviceRecognizer;
pub use reconcile::{diff, index_by_mac};
