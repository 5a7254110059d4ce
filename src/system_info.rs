// Agent-side system info via sysinfo, sent once with Init.

use sysinfo::System;
use tracing::instrument;

use crate::models::SystemInfo;

/// Host name as reported by the OS, if any.
pub fn host_name() -> Option<String> {
    System::host_name().filter(|h| !h.trim().is_empty())
}

/// Gathers static host and process identity. Runs the sysinfo refresh off the async threads.
#[instrument(fields(operation = "collect_system_info"))]
pub async fn collect(agent_version: &str) -> anyhow::Result<SystemInfo> {
    let agent_version = agent_version.to_string();
    tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let processor_name = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown".into());
        let process_id = sysinfo::get_current_pid()
            .map(|pid| pid.as_u32())
            .unwrap_or(std::process::id());

        Ok(SystemInfo {
            host_name: host_name().unwrap_or_else(|| "unknown".into()),
            os_name: System::name().unwrap_or_default(),
            os_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            processor_name,
            logical_cores: sys.cpus().len() as u32,
            total_memory_bytes: sys.total_memory(),
            process_id,
            start_time: crate::db::now_millis(),
            agent_version,
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("sysinfo task join: {}", e))?
}
