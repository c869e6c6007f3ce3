//! Bridge configuration file
//!
//! All settings live in one TOML file. Every section and field is optional;
//! missing values fall back to the defaults below. A missing file is written
//! out with the defaults so operators have something to edit, while a file
//! that fails to parse stops startup.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::device::{DeviceTopics, HeartbeatConfig, VioConfig};
use crate::forwarder::{CompletionPolicy, SourceConfig, StreamKind, StreamSettings};
use crate::mqtt::{ConnectionConfig, QosLevel, RetryPolicy};

const CONFIG_DIR: &str = "vibot-bridge";
const CONFIG_FILE: &str = "config.toml";

/// Settings of one forwarded stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub local_topic: String,
    pub broker_topic: String,
    #[serde(default = "ForwarderConfig::default_qos")]
    pub qos: QosLevel,
    /// Frames forwarded per session before it completes
    #[serde(default = "ForwarderConfig::default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub exit_on_complete: bool,
    #[serde(default = "ForwarderConfig::default_throttle_ms")]
    pub throttle_ms: u64,
}

impl ForwarderConfig {
    fn new(local_topic: &str, broker_topic: &str) -> Self {
        Self {
            local_topic: local_topic.to_string(),
            broker_topic: broker_topic.to_string(),
            qos: Self::default_qos(),
            limit: Self::default_limit(),
            exit_on_complete: false,
            throttle_ms: Self::default_throttle_ms(),
        }
    }

    fn default_qos() -> QosLevel {
        QosLevel::ExactlyOnce
    }

    fn default_limit() -> u64 {
        1000
    }

    fn default_throttle_ms() -> u64 {
        10
    }

    pub fn settings(&self, kind: StreamKind) -> StreamSettings {
        StreamSettings {
            kind,
            local_topic: self.local_topic.clone(),
            broker_topic: self.broker_topic.clone(),
            qos: self.qos,
            throttle: Duration::from_millis(self.throttle_ms),
        }
    }

    pub fn completion(&self) -> CompletionPolicy {
        CompletionPolicy::from_exit_on_complete(self.exit_on_complete)
    }
}

fn default_point_cloud() -> ForwarderConfig {
    ForwarderConfig::new("/PR_BE/point_cloud", "/data/point_cloud")
}

fn default_image() -> ForwarderConfig {
    ForwarderConfig::new("/PR_BE/image", "/data/img")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// An `end_*_transfer` command also shuts the process down
    #[serde(default)]
    pub exit_on_stop_command: bool,
    #[serde(default)]
    pub broker: ConnectionConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub topics: DeviceTopics,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub vio: VioConfig,
    /// Local broker the sensor drivers publish frames on
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default = "default_point_cloud")]
    pub point_cloud: ForwarderConfig,
    #[serde(default = "default_image")]
    pub image: ForwarderConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            exit_on_stop_command: false,
            broker: ConnectionConfig::default(),
            retry: RetryPolicy::default(),
            topics: DeviceTopics::default(),
            heartbeat: HeartbeatConfig::default(),
            vio: VioConfig::default(),
            source: SourceConfig::default(),
            point_cloud: default_point_cloud(),
            image: default_image(),
        }
    }
}

impl BridgeConfig {
    pub fn stream(&self, kind: StreamKind) -> &ForwarderConfig {
        match kind {
            StreamKind::PointCloud => &self.point_cloud,
            StreamKind::Image => &self.image,
        }
    }

    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the file at `path` (or the default location), creating it with
    /// defaults when it does not exist yet.
    pub async fn load_or_create(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if {} exists: {}", path.display(), e))?
        {
            info!("No config at {}, writing defaults", path.display());
            let config = Self::default();
            config.save(&path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }
}
