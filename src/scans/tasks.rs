//! Background tasks driving the coordinator: the worker event listener and
//! the stalled-scan watchdog.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info};

use super::coordinator::ScanCoordinator;
use crate::worker::channel::WorkerEventStream;
use crate::worker::protocol::WorkerEvent;

/// Route every inbound worker event to the coordinator until the stream ends.
pub fn spawn_worker_listener(
    coordinator: Arc<ScanCoordinator>,
    mut events: WorkerEventStream,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            dispatch(&coordinator, event).await;
        }
        info!("Worker event stream ended");
    })
}

async fn dispatch(coordinator: &ScanCoordinator, event: WorkerEvent) {
    let scan_id = event.scan_id();
    let result = match event {
        WorkerEvent::Progress {
            scan_id,
            progress,
            devices_found,
        } => coordinator.handle_progress(scan_id, progress, devices_found).await,
        WorkerEvent::Report(report) => coordinator.handle_completion(report).await.map(|_| ()),
        WorkerEvent::Error { scan_id, message } => {
            coordinator.handle_failure(scan_id, &message).await.map(|_| ())
        }
        WorkerEvent::Ack { scan_id, command } => {
            debug!(%scan_id, command, "Worker acknowledged command");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!(%scan_id, error = %e, "Failed to apply worker event");
    }
}

/// Periodically fail scans that stopped reporting.
pub fn spawn_watchdog(coordinator: Arc<ScanCoordinator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(coordinator.config().watchdog_interval);
        loop {
            interval.tick().await;
            match coordinator.sweep_stalled().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "Watchdog failed stalled scans"),
                Err(e) => error!(error = %e, "Watchdog sweep failed"),
            }
        }
    })
}
