//! State pull used to resynchronize a client after (re)connecting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::devices::model::DeviceRecord;
use crate::error::TransportError;
use crate::identity::{Principal, USER_ID_HEADER, USER_ROLE_HEADER};
use crate::scans::model::ScanJob;

/// Current server-side view: recent jobs and known devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub jobs: Vec<ScanJob>,
    pub devices: Vec<DeviceRecord>,
}

/// Where a session pulls its snapshot from.
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn fetch(&self) -> Result<StateSnapshot, TransportError>;
}

/// Pulls `/api/scan/history` and `/api/devices` over HTTP.
pub struct HttpStateSource {
    client: reqwest::Client,
    base_url: String,
    principal: Principal,
    location_id: Option<String>,
}

impl HttpStateSource {
    pub fn new(base_url: impl Into<String>, principal: Principal) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            principal,
            location_id: None,
        }
    }

    /// Restrict the snapshot to one location.
    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let mut request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header(USER_ID_HEADER, &self.principal.user_id)
            .header(USER_ROLE_HEADER, self.principal.role.to_string());
        if let Some(location) = &self.location_id {
            request = request.query(&[("location_id", location)]);
        }

        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .json()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

#[async_trait]
impl StateSource for HttpStateSource {
    async fn fetch(&self) -> Result<StateSnapshot, TransportError> {
        let jobs = self.get("/api/scan/history").await?;
        let devices = self.get("/api/devices").await?;
        Ok(StateSnapshot { jobs, devices })
    }
}
