use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lanscan::config::{BusConfig, CoordinatorConfig, ServerConfig, WorkerConfig};
use lanscan::events::EventBus;
use lanscan::scans::{ScanCoordinator, spawn_watchdog, spawn_worker_listener};
use lanscan::worker::{WorkerChannel, WsWorkerChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_config = ServerConfig::from_env();
    server_config.validate().context("invalid server configuration")?;

    // Keep the guard alive for the whole run so buffered log lines flush.
    let _log_guard = init_tracing(&server_config);

    eprintln!("📡 LAN Scan v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api/scan", server_config.bind_addr);
    eprintln!("   Push WS: ws://{}/ws", server_config.bind_addr);

    // ── Store ───────────────────────────────────────────────────────────
    let store = lanscan::open_store(&server_config)
        .await
        .with_context(|| format!("opening store at {}", server_config.db_path))?;
    eprintln!("   Database: {}", server_config.db_path);

    // ── Worker link + bus ───────────────────────────────────────────────
    let worker_config = WorkerConfig::from_env();
    eprintln!("   Worker: {}", worker_config.url);
    let worker = Arc::new(WsWorkerChannel::spawn(worker_config));
    let worker_events = worker.events().await.context("taking worker event stream")?;

    let bus = EventBus::new(BusConfig::from_env().queue_capacity);

    // ── Coordinator ─────────────────────────────────────────────────────
    let coordinator = Arc::new(ScanCoordinator::new(
        CoordinatorConfig::from_env(),
        Arc::clone(&store),
        worker,
        bus.clone(),
    ));

    match coordinator.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {} scans left active by a previous run", n),
        Err(e) => warn!(error = %e, "Orphan recovery failed"),
    }

    let _listener_handle = spawn_worker_listener(Arc::clone(&coordinator), worker_events);
    let _watchdog_handle = spawn_watchdog(Arc::clone(&coordinator));

    // ── HTTP server ─────────────────────────────────────────────────────
    let app = lanscan::app(coordinator, bus.clone());
    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr)
        .await
        .with_context(|| format!("binding {}", server_config.bind_addr))?;
    info!(addr = %server_config.bind_addr, "LAN Scan server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            // Ends every push connection so the server can drain.
            bus.close();
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}

/// stderr always; a daily-rolling file too when a log directory is configured.
fn init_tracing(config: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lanscan.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
