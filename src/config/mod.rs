//! # Configuration
//!
//! TOML configuration with a default for every field, so a partial file (or an empty
//! one) is valid. CLI overrides are applied by the binary after [`Config::load`], and
//! [`Config::validate`] runs last.
//!
//! ```toml
//! [bot]
//! name = "meshbridge"
//!
//! [primary]
//! enabled = true
//! device = "/dev/ttyUSB0"      # or "tcp://192.168.1.20:4403"
//!
//! [companion]
//! enabled = true
//! device = "/dev/ttyACM0"
//! mode = "client"              # "client" or "frame"
//! # raw_device = "/dev/ttyACM1"  # optional send-only frame lane
//!
//! [supervisor]
//! health_check_interval_secs = 15
//! silence_threshold_secs = 90
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::packet::{is_concrete, NodeId};
use crate::router::SchedulerConfig;
use crate::supervisor::SupervisorConfig;
use crate::transport::meshcore::CompanionMode;
use crate::transport::DeviceDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub primary: PrimaryConfig,
    pub companion: CompanionConfig,
    pub supervisor: SupervisorSection,
    pub dedup: DedupConfig,
    pub outbound: OutboundConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Name the builtin commands answer with.
    pub name: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "meshbridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    pub enabled: bool,
    /// Serial path, `host:port` or `tcp://host[:port]`.
    pub device: String,
    pub baud_rate: u32,
    pub tcp_port: u16,
    /// Own node id (`!a1b2c3d4`, `0x...` or decimal). Empty: learn it from the radio.
    pub node_id: String,
    pub connect_timeout_secs: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            tcp_port: 4403,
            node_id: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub enabled: bool,
    pub device: String,
    /// `client` (contact sync, direct messages) or `frame` (raw frames only).
    pub mode: String,
    /// Optional second lane opened in frame mode and used for broadcasts only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_device: Option<String>,
    pub baud_rate: u32,
    pub tcp_port: u16,
    pub node_id: String,
    pub connect_timeout_secs: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "/dev/ttyACM0".to_string(),
            mode: "client".to_string(),
            raw_device: None,
            baud_rate: 115200,
            tcp_port: 5000,
            node_id: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl CompanionConfig {
    pub fn companion_mode(&self) -> Result<CompanionMode> {
        match self.mode.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(CompanionMode::Client),
            "frame" | "raw" => Ok(CompanionMode::Frame),
            other => Err(anyhow!("companion.mode must be 'client' or 'frame', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub health_check_interval_secs: u64,
    pub silence_threshold_secs: u64,
    pub settle_delay_ms: u64,
    pub stabilize_delay_ms: u64,
    pub retry_delay_secs: u64,
    pub startup_attempts: u32,
    pub config_retry_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let d = SupervisorConfig::default();
        Self {
            health_check_interval_secs: d.health_check_interval.as_secs(),
            silence_threshold_secs: d.silence_threshold.as_secs(),
            settle_delay_ms: d.settle_delay.as_millis() as u64,
            stabilize_delay_ms: d.stabilize_delay.as_millis() as u64,
            retry_delay_secs: d.retry_delay.as_secs(),
            startup_attempts: d.startup_attempts,
            config_retry_secs: d.config_retry.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: crate::dedup::DEFAULT_WINDOW.as_secs(),
            max_entries: crate::dedup::DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub min_send_gap_ms: u64,
    pub max_queue: usize,
    pub aging_threshold_ms: u64,
    pub stats_interval_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        let d = SchedulerConfig::default();
        Self {
            min_send_gap_ms: d.min_send_gap.as_millis() as u64,
            max_queue: d.max_queue,
            aging_threshold_ms: d.aging_threshold.as_millis() as u64,
            stats_interval_ms: d.stats_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn contacts_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("contacts.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshbridge.log".to_string()),
        }
    }
}

/// Parse `!a1b2c3d4`, `0xa1b2c3d4` or a decimal id. Empty means "not configured".
pub fn parse_node_id(s: &str) -> Result<Option<NodeId>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let id = if let Some(hex) = s.strip_prefix('!').or_else(|| s.strip_prefix("0x")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    }
    .map_err(|e| anyhow!("invalid node id '{}': {}", s, e))?;
    if !is_concrete(id) {
        bail!("node id '{}' is reserved", s);
    }
    Ok(Some(id))
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let s = &self.supervisor;
        SupervisorConfig {
            health_check_interval: Duration::from_secs(s.health_check_interval_secs),
            silence_threshold: Duration::from_secs(s.silence_threshold_secs),
            settle_delay: Duration::from_millis(s.settle_delay_ms),
            stabilize_delay: Duration::from_millis(s.stabilize_delay_ms),
            retry_delay: Duration::from_secs(s.retry_delay_secs),
            startup_attempts: s.startup_attempts,
            config_retry: Duration::from_secs(s.config_retry_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let o = &self.outbound;
        SchedulerConfig {
            min_send_gap: Duration::from_millis(o.min_send_gap_ms),
            max_queue: o.max_queue,
            aging_threshold: Duration::from_millis(o.aging_threshold_ms),
            stats_interval: Duration::from_millis(o.stats_interval_ms),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup.window_secs)
    }

    pub fn primary_device(&self) -> Result<DeviceDescriptor> {
        let p = &self.primary;
        Ok(DeviceDescriptor::parse(&p.device, p.baud_rate, p.tcp_port)?)
    }

    pub fn companion_device(&self) -> Result<DeviceDescriptor> {
        let c = &self.companion;
        Ok(DeviceDescriptor::parse(&c.device, c.baud_rate, c.tcp_port)?)
    }

    pub fn companion_raw_device(&self) -> Result<Option<DeviceDescriptor>> {
        let c = &self.companion;
        match c.raw_device.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(dev) => Ok(Some(DeviceDescriptor::parse(dev, c.baud_rate, c.tcp_port)?)),
        }
    }

    /// Reject configurations the bot cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.primary.enabled && !self.companion.enabled {
            bail!("at least one of [primary] or [companion] must be enabled");
        }
        self.supervisor_config()
            .validate()
            .map_err(|e| anyhow!("[supervisor] {}", e))?;
        if self.dedup.window_secs == 0 {
            bail!("[dedup] window_secs must be greater than zero");
        }
        if self.dedup.max_entries == 0 {
            bail!("[dedup] max_entries must be greater than zero");
        }
        if self.outbound.max_queue == 0 {
            bail!("[outbound] max_queue must be greater than zero");
        }
        if self.primary.enabled {
            self.primary_device().map_err(|e| anyhow!("[primary] device: {}", e))?;
            parse_node_id(&self.primary.node_id).map_err(|e| anyhow!("[primary] {}", e))?;
        }
        if self.companion.enabled {
            let mode = self.companion.companion_mode()?;
            self.companion_device().map_err(|e| anyhow!("[companion] device: {}", e))?;
            if self.companion_raw_device().map_err(|e| anyhow!("[companion] raw_device: {}", e))?.is_some()
                && mode != CompanionMode::Client
            {
                bail!("[companion] raw_device needs mode = \"client\" on the main device");
            }
            parse_node_id(&self.companion.node_id).map_err(|e| anyhow!("[companion] {}", e))?;
        }
        Ok(())
    }
}
