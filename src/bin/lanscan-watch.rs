//! Tail a LAN Scan server's push feed from the terminal.

use std::sync::Arc;

use lanscan::config::SessionConfig;
use lanscan::events::{PushEvent, Topic};
use lanscan::identity::{Principal, Role};
use lanscan::session::{
    ClientSession, HttpStateSource, ReconnectPolicy, SessionNotice, StateSource, WsTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let config = SessionConfig::from_env();
    let user_id = std::env::var("LANSCAN_USER_ID").unwrap_or_else(|_| "watcher".to_string());
    let role = std::env::var("LANSCAN_USER_ROLE")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(Role::Viewer);

    let mut source = HttpStateSource::new(&config.api_url, Principal::new(user_id, role));
    if let Ok(location) = std::env::var("LANSCAN_LOCATION_ID") {
        source = source.with_location(location);
    }
    let source: Arc<dyn StateSource> = Arc::new(source);

    eprintln!("👀 Watching {}", config.url);

    let (mut session, mut notices) = ClientSession::new(
        ReconnectPolicy::from(&config),
        Arc::new(WsTransport::new(&config.url)),
        Some(source),
        [Topic::ScanStatus, Topic::DeviceStatus, Topic::Alert],
    );
    session.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    SessionNotice::Event(event) => print_event(&event),
                    SessionNotice::Resynced(snapshot) => eprintln!(
                        "   synced: {} scans, {} devices",
                        snapshot.jobs.len(),
                        snapshot.devices.len()
                    ),
                    SessionNotice::Reconnecting { attempt, delay } => {
                        eprintln!("   reconnecting (attempt {attempt}) in {delay:?}")
                    }
                    SessionNotice::ConnectivityFailed { attempts } => {
                        eprintln!("   giving up after {attempts} failed attempts");
                        break;
                    }
                }
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn print_event(event: &PushEvent) {
    let ts = event.timestamp().format("%H:%M:%S");
    match event {
        PushEvent::ScanStatus { data, .. } => println!(
            "{ts} scan {} [{}] {} {}% ({} devices){}",
            data.scan_id,
            data.location_id,
            data.status,
            data.progress,
            data.devices_found,
            data.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default()
        ),
        PushEvent::DeviceStatus { data, .. } => println!(
            "{ts} device {} {} {:?} ({})",
            data.mac,
            data.ip,
            data.status,
            data.hostname.as_deref().unwrap_or("-")
        ),
        PushEvent::Alert { data, .. } => {
            println!("{ts} alert {:?}: {} {}", data.severity, data.title, data.message)
        }
    }
}
