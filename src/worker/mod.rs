//! Scanning worker control link.

pub mod channel;
pub mod protocol;

pub use channel::{WorkerChannel, WorkerEventStream, WsWorkerChannel};
pub use protocol::{ScanReport, WorkerCommand, WorkerEvent};
