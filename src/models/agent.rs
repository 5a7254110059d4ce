// Agent identity and configuration exchanged on init.

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Host/process identity reported once per agent start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub host_name: String,
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub processor_name: String,
    pub logical_cores: u32,
    pub total_memory_bytes: u64,
    pub process_id: u32,
    pub start_time: i64,
    pub agent_version: String,
}

/// Settings the collector may override from the server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub slow_threshold_millis: u64,
    pub profiling_interval_millis: u32,
    pub gauge_period_secs: u32,
    pub max_aggregate_transactions_per_type: u32,
    pub gauge_names: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            slow_threshold_millis: 2_000,
            profiling_interval_millis: 1_000,
            gauge_period_secs: 5,
            max_aggregate_transactions_per_type: 500,
            gauge_names: Vec::new(),
        }
    }
}
