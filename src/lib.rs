//! LAN Scan: network scan coordination and live device push.

pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod identity;
pub mod scans;
pub mod session;
pub mod store;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::events::{EventBus, push_routes};
use crate::scans::{ScanCoordinator, scan_routes};
use crate::store::{LibSqlStore, MemoryStore, ScanStore};

/// The full HTTP surface: REST scan API plus the `/ws` push endpoint.
pub fn app(coordinator: Arc<ScanCoordinator>, bus: EventBus) -> Router {
    scan_routes(coordinator)
        .merge(push_routes(bus))
        .layer(CorsLayer::permissive())
}

/// Validate the server config and open the store it names.
/// `:memory:` selects the in-process store.
pub async fn open_store(config: &ServerConfig) -> error::Result<Arc<dyn ScanStore>> {
    config.validate()?;
    if config.db_path == ":memory:" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = LibSqlStore::new_local(std::path::Path::new(&config.db_path)).await?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_picks_backend() {
        let memory = ServerConfig {
            db_path: ":memory:".to_string(),
            ..ServerConfig::default()
        };
        let store = open_store(&memory).await.unwrap();
        assert!(store.list_active_jobs().await.unwrap().is_empty());

        let tmp = tempfile::tempdir().unwrap();
        let on_disk = ServerConfig {
            db_path: tmp.path().join("data/lanscan.db").display().to_string(),
            ..ServerConfig::default()
        };
        open_store(&on_disk).await.unwrap();
        assert!(tmp.path().join("data/lanscan.db").exists());
    }

    #[tokio::test]
    async fn open_store_rejects_bad_config() {
        let config = ServerConfig {
            bind_addr: "nowhere".to_string(),
            db_path: ":memory:".to_string(),
            log_dir: None,
        };
        assert!(matches!(
            open_store(&config).await,
            Err(error::Error::Config(_))
        ));
    }
}
