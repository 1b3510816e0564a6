//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProxyError;
use crate::Result;

/// Static proxy configuration, loaded once at startup from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Admin API port (health, metrics, intercept control). Disabled when unset.
    pub admin_port: Option<u16>,
    /// Directory scanned for codec plugin descriptors
    pub plugin_dir: Option<PathBuf>,
    pub listeners: Vec<ListenerConfig>,
    pub pipeline: PipelineConfig,
    pub intercept: GateConfig,
    pub replay: ReplayConfig,
}

/// One plain forward listener: everything accepted is piped to `upstream`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    /// `host:port` of the server every accepted connection is piped to
    pub upstream: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Sub-protocol handed to the codec factory
    #[serde(default)]
    pub alpn: Option<String>,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_codec() -> String {
    "Sample".to_string()
}

/// Stream engine and recording parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for bytes sitting unconsumed in an engine buffer
    pub watchdog_timeout_ms: u64,
    /// Read deadline while the buffer is empty
    pub idle_timeout_ms: u64,
    pub read_buffer_size: usize,
    /// Messages smaller than this are persisted at every pipeline stage
    pub record_every_stage_below: usize,
    /// Messages queued between the server reader and the client writer
    pub flow_control_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 30_000,
            idle_timeout_ms: 24 * 60 * 60 * 1000,
            read_buffer_size: 100 * 1024,
            record_every_stage_below: 1024 * 1024,
            flow_control_capacity: 64,
        }
    }
}

impl PipelineConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Intercept gate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Start with interception armed
    pub armed: bool,
    /// Total sends produced by forward-multiple, the gated one included
    pub forward_multiple_total: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            armed: false,
            forward_multiple_total: 20,
        }
    }
}

/// Replay controller parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Units fired at the same time
    pub max_parallel: usize,
    /// Longest a waiting caller blocks on a multi-unit batch
    pub wait_ceiling_ms: u64,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            wait_ceiling_ms: 20_000,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
        }
    }
}

impl ReplayConfig {
    pub fn wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.wait_ceiling_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl ProxyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ProxyConfig = toml::from_str(content)
            .map_err(|e| ProxyError::configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        for listener in &self.listeners {
            if listener.codec.trim().is_empty() {
                return Err(ProxyError::configuration(format!(
                    "listener on port {} has an empty codec name",
                    listener.listen_port
                )));
            }
            if listener.upstream.trim().is_empty() {
                return Err(ProxyError::configuration(format!(
                    "listener on port {} has no upstream",
                    listener.listen_port
                )));
            }
        }
        if self.pipeline.watchdog_timeout_ms == 0 || self.pipeline.idle_timeout_ms == 0 {
            return Err(ProxyError::configuration("engine timeouts must be non-zero"));
        }
        if self.pipeline.read_buffer_size == 0 || self.pipeline.flow_control_capacity == 0 {
            return Err(ProxyError::configuration(
                "read buffer and flow control capacity must be non-zero",
            ));
        }
        if self.intercept.forward_multiple_total == 0 {
            return Err(ProxyError::configuration(
                "forward_multiple_total must be at least 1",
            ));
        }
        if self.replay.max_parallel == 0 {
            return Err(ProxyError::configuration("replay.max_parallel must be at least 1"));
        }
        if self.replay.connect_timeout_ms == 0 || self.replay.response_timeout_ms == 0 {
            return Err(ProxyError::configuration("replay timeouts must be non-zero"));
        }
        Ok(())
    }
}
