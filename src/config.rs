use serde::Deserialize;

use crate::collector::AgentSettings;
use crate::rollup_schedule::{RollupLevelConfig, RollupSchedule, default_level_configs};
use crate::transport::protocol::{DEFAULT_COLLECTOR_PORT, DEFAULT_MAX_FRAME_BYTES};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    /// Only read by agent-side embeddings; the collector binary ignores it.
    #[serde(default)]
    pub agent: AgentSettings,
}

/// HTTP query API.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Agent ingest listener.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_host")]
    pub host: String,
    #[serde(default = "default_collector_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: default_collector_host(),
            port: default_collector_port(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_collector_host() -> String {
    "0.0.0.0".into()
}

fn default_collector_port() -> u16 {
    DEFAULT_COLLECTOR_PORT
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_pool_size: u32,
    /// Hours to keep traces; 4294967295 keeps them forever.
    #[serde(default = "default_trace_retention_hours")]
    pub trace_retention_hours: u32,
}

fn default_trace_retention_hours() -> u32 {
    24 * 7
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_rollup_interval_secs")]
    pub interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
    #[serde(default = "default_level_configs")]
    pub levels: Vec<RollupLevelConfig>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rollup_interval_secs(),
            vacuum_schedule: None,
            vacuum_interval_secs: default_vacuum_interval_secs(),
            levels: default_level_configs(),
        }
    }
}

fn default_rollup_interval_secs() -> u64 {
    30
}

fn default_vacuum_interval_secs() -> u64 {
    24 * 3600
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// The validated rollup schedule built from `[[rollup.levels]]`.
    pub fn rollup_schedule(&self) -> anyhow::Result<RollupSchedule> {
        RollupSchedule::new(&self.rollup.levels).map_err(|e| anyhow::anyhow!("rollup.levels: {e}"))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            self.collector.port > 0,
            "collector.port must be between 1 and 65535, got {}",
            self.collector.port
        );
        anyhow::ensure!(
            self.collector.max_frame_bytes >= 1024,
            "collector.max_frame_bytes must be >= 1024, got {}",
            self.collector.max_frame_bytes
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.database.trace_retention_hours > 0,
            "database.trace_retention_hours must be > 0, got {}",
            self.database.trace_retention_hours
        );
        anyhow::ensure!(
            self.rollup.interval_secs > 0,
            "rollup.interval_secs must be > 0, got {}",
            self.rollup.interval_secs
        );
        anyhow::ensure!(
            self.rollup.vacuum_interval_secs > 0,
            "rollup.vacuum_interval_secs must be > 0, got {}",
            self.rollup.vacuum_interval_secs
        );
        for (i, level) in self.rollup.levels.iter().enumerate() {
            anyhow::ensure!(
                level.expiration_hours > 0,
                "rollup.levels[{}].expiration_hours must be > 0, got {}",
                i,
                level.expiration_hours
            );
            anyhow::ensure!(
                level.view_threshold_millis >= 0,
                "rollup.levels[{}].view_threshold_millis must be >= 0, got {}",
                i,
                level.view_threshold_millis
            );
        }
        self.rollup_schedule()?;
        Ok(())
    }
}
