//! Client for the local visual-inertial odometry service

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::CommandError;

/// Code reported when the service could not be reached at all
pub const CODE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VioConfig {
    pub enable_url: String,
    pub disable_url: String,
    pub timeout_ms: u64,
}

impl Default for VioConfig {
    fn default() -> Self {
        Self {
            enable_url: "http://localhost:8000/Smart/algorithmEnable".to_string(),
            disable_url: "http://localhost:8000/Smart/algorithmDisable".to_string(),
            timeout_ms: 5000,
        }
    }
}

/// Switches the vio algorithm on or off.
///
/// Returns the HTTP status code of the service. An `Err` means no status
/// was received.
#[async_trait]
pub trait VioService: Send + Sync {
    async fn set_enabled(&self, enabled: bool) -> Result<u16, CommandError>;
}

pub struct HttpVioService {
    config: VioConfig,
    client: reqwest::Client,
}

impl HttpVioService {
    pub fn new(config: VioConfig) -> Result<Self, CommandError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, enabled: bool) -> &str {
        if enabled {
            &self.config.enable_url
        } else {
            &self.config.disable_url
        }
    }
}

#[async_trait]
impl VioService for HttpVioService {
    async fn set_enabled(&self, enabled: bool) -> Result<u16, CommandError> {
        let url = self.url(enabled);
        debug!("PUT {}", url);
        let response = self.client.put(url).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                CommandError::VioUnavailable(format!("{}: {}", url, e))
            } else {
                CommandError::Vio(e)
            }
        })?;
        let code = response.status().as_u16();

        let action = if enabled { "enable" } else { "disable" };
        if response.status().is_success() {
            info!("Vio algorithm {}d", action);
        } else {
            warn!(
                "Failed to {} vio algorithm (code {}), please {} it manually",
                action, code, action
            );
        }
        Ok(code)
    }
}
