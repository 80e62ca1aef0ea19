use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub display: DisplayConfig,
    pub push_rtsp: PushRtspConfig,
    pub push_rtmp: PushRtmpConfig,
    pub recording: RecordingConfig,
    pub restart: RestartConfig,
    pub graph: GraphConfig,
}

/// Settings applied to the network source node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub latency_ms: u32,
    pub udp_reconnect: bool,
    pub timeout_us: u64,
    pub do_retransmission: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            latency_ms: 41,
            udp_reconnect: true,
            timeout_us: 0,
            do_retransmission: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub decoder: String,
    pub sink: String,
    pub sync: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            decoder: "avdec_h264".to_string(),
            sink: "autovideosink".to_string(),
            sync: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushRtspConfig {
    pub protocols: String,
    pub latency_ms: u32,
    pub eos_timeout_ms: u64,
}

impl Default for PushRtspConfig {
    fn default() -> Self {
        Self {
            protocols: "tcp".to_string(),
            latency_ms: 10_000,
            eos_timeout_ms: 900,
        }
    }
}

impl PushRtspConfig {
    pub fn eos_timeout(&self) -> Duration {
        Duration::from_millis(self.eos_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PushRtmpConfig {
    pub sync: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Host recording requests are rejected unless this is set.
    pub enabled: bool,
    pub extension: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extension: "flv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    pub window_ms: u64,
    pub max_streak: u32,
    pub backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_streak: 4,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Name given to the top-level pipeline.
    pub name: String,
    pub state_timeout_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: "rtsp-fanout".to_string(),
            state_timeout_ms: 2000,
        }
    }
}

impl GraphConfig {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display.decoder.trim().is_empty() || self.display.sink.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "display decoder and sink factories must be set".to_string(),
            ));
        }
        if self.push_rtsp.eos_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "push_rtsp.eos_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.graph.state_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "graph.state_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.restart.window_ms == 0 || self.restart.max_streak == 0 {
            return Err(ConfigError::Invalid(
                "restart window and streak cap must be greater than zero".to_string(),
            ));
        }
        if self.recording.extension.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "recording.extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
