//! Scans: job model, coordinator, background tasks and REST routes.

pub mod coordinator;
pub mod model;
pub mod routes;
pub mod tasks;

pub use coordinator::ScanCoordinator;
pub use model::{CustomOptions, ScanJob, ScanKind, ScanOptions, ScanStatus};
pub use routes::scan_routes;
pub use tasks::{spawn_watchdog, spawn_worker_listener};
