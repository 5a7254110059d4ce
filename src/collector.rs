// Agent-side facade: the single entry point the instrumentation host calls.
// Init blocks until delivered; everything else is fire-and-forget with bounded retries.

use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::agent_rollup::AgentRollupId;
use crate::error::TransportError;
use crate::log_forwarding::LogScope;
use crate::models::{AgentConfig, AggregatesByType, GaugeValue, LogEvent, SystemInfo, Trace};
use crate::transport::protocol::DEFAULT_COLLECTOR_PORT;
use crate::transport::{Channel, Request, Response, RetryingTransport, TcpChannel, TransportOptions};

pub const AGENT_ID_ENV: &str = "APM_AGENT_ID";
pub const COLLECTOR_HOST_ENV: &str = "APM_COLLECTOR_HOST";
pub const COLLECTOR_PORT_ENV: &str = "APM_COLLECTOR_PORT";
const DEFAULT_COLLECTOR_HOST: &str = "localhost";
const UNKNOWN_AGENT_ID: &str = "unknown";

/// `[agent]` settings as configured; any of them may be left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentSettings {
    pub id: Option<String>,
    pub collector_host: Option<String>,
    pub collector_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgentSettings {
    pub agent_id: AgentRollupId,
    pub collector_host: String,
    pub collector_port: u16,
}

impl ResolvedAgentSettings {
    pub fn collector_addr(&self) -> String {
        format!("{}:{}", self.collector_host, self.collector_port)
    }
}

impl AgentSettings {
    /// Resolves against the process environment and the OS host name.
    pub fn resolve(&self) -> anyhow::Result<ResolvedAgentSettings> {
        self.resolve_with(|key| std::env::var(key).ok(), crate::system_info::host_name)
    }

    /// Id: explicit, then `APM_AGENT_ID`, then host name, then "unknown".
    /// Host: explicit, then `APM_COLLECTOR_HOST`, then localhost.
    /// Port: explicit, then `APM_COLLECTOR_PORT`, then 8181.
    pub fn resolve_with<E, H>(&self, env: E, host_name: H) -> anyhow::Result<ResolvedAgentSettings>
    where
        E: Fn(&str) -> Option<String>,
        H: FnOnce() -> Option<String>,
    {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let raw_id = non_empty(self.id.clone())
            .or_else(|| non_empty(env(AGENT_ID_ENV)))
            .or_else(|| non_empty(host_name()))
            .unwrap_or_else(|| UNKNOWN_AGENT_ID.to_string());
        let agent_id = AgentRollupId::parse(&raw_id)
            .map_err(|e| anyhow::anyhow!("agent id {raw_id:?}: {e}"))?;

        let collector_host = non_empty(self.collector_host.clone())
            .or_else(|| non_empty(env(COLLECTOR_HOST_ENV)))
            .unwrap_or_else(|| DEFAULT_COLLECTOR_HOST.to_string());

        let collector_port = match self.collector_port {
            Some(port) => port,
            None => match non_empty(env(COLLECTOR_PORT_ENV)) {
                Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                    anyhow::anyhow!("{COLLECTOR_PORT_ENV}={raw:?} is not a valid port: {e}")
                })?,
                None => DEFAULT_COLLECTOR_PORT,
            },
        };
        anyhow::ensure!(collector_port > 0, "collector port must be > 0");

        Ok(ResolvedAgentSettings {
            agent_id,
            collector_host,
            collector_port,
        })
    }
}

pub struct Collector<C = TcpChannel> {
    agent_id: AgentRollupId,
    transport: RetryingTransport<C>,
}

impl Collector<TcpChannel> {
    /// Builds a collector for the resolved destination. Connects lazily on the first call.
    pub fn connect(settings: &ResolvedAgentSettings, runtime: Handle) -> Self {
        let channel = TcpChannel::new(settings.collector_addr());
        Self::new(
            settings.agent_id.clone(),
            RetryingTransport::new(channel, runtime),
        )
    }

    pub fn connect_with_options(
        settings: &ResolvedAgentSettings,
        runtime: Handle,
        options: TransportOptions,
    ) -> Self {
        let channel = TcpChannel::new(settings.collector_addr());
        Self::new(
            settings.agent_id.clone(),
            RetryingTransport::with_options(channel, runtime, options),
        )
    }
}

impl<C: Channel> Collector<C> {
    pub fn new(agent_id: AgentRollupId, transport: RetryingTransport<C>) -> Self {
        Self {
            agent_id,
            transport,
        }
    }

    pub fn agent_id(&self) -> &AgentRollupId {
        &self.agent_id
    }

    pub fn transport(&self) -> &RetryingTransport<C> {
        &self.transport
    }

    /// Sends Init, retrying until delivered. A config pushed back by the collector is handed
    /// to `updater` and returned; an updater failure is logged, not propagated.
    pub async fn init<F>(
        &self,
        system_info: SystemInfo,
        agent_config: AgentConfig,
        updater: F,
    ) -> Option<AgentConfig>
    where
        F: FnOnce(&AgentConfig) -> anyhow::Result<()>,
    {
        let request = Request::Init {
            agent_id: self.agent_id.clone(),
            system_info,
            agent_config,
        };
        match self.transport.call_until_successful(request).await {
            Some(Response::Init {
                updated_agent_config: Some(updated),
            }) => {
                info!(agent_id = %self.agent_id, "collector pushed an updated agent config");
                if let Err(e) = updater(&updated) {
                    warn!(agent_id = %self.agent_id, error = %e, "failed to apply agent config from collector");
                }
                Some(updated)
            }
            Some(_) => None,
            None => {
                debug!(agent_id = %self.agent_id, "init not delivered, transport closed");
                None
            }
        }
    }

    pub fn collect_aggregates(
        &self,
        capture_time: i64,
        aggregates_by_type: Vec<AggregatesByType>,
        shared_query_texts: Vec<String>,
    ) {
        self.transport.call_with_a_few_retries(
            Request::CollectAggregates {
                agent_id: self.agent_id.clone(),
                capture_time,
                aggregates_by_type,
                shared_query_texts,
            },
            |_| {},
        );
    }

    pub fn collect_gauge_values(&self, gauge_values: Vec<GaugeValue>) {
        self.transport.call_with_a_few_retries(
            Request::CollectGaugeValues {
                agent_id: self.agent_id.clone(),
                gauge_values,
            },
            |_| {},
        );
    }

    pub fn collect_trace(&self, trace: Trace) {
        self.transport.call_with_a_few_retries(
            Request::CollectTrace {
                agent_id: self.agent_id.clone(),
                trace,
            },
            |_| {},
        );
    }

    /// Events logged while reporting a transport failure are never sent.
    pub fn log(&self, log_event: LogEvent, scope: LogScope) {
        if scope == LogScope::Transport {
            return;
        }
        self.transport.call_with_a_few_retries(
            Request::Log {
                agent_id: self.agent_id.clone(),
                log_event,
            },
            |_| {},
        );
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn explicit_settings_win() {
        let settings = AgentSettings {
            id: Some("prod::web-1".into()),
            collector_host: Some("collector.internal".into()),
            collector_port: Some(9000),
        };
        let r = settings
            .resolve_with(
                env(&[(AGENT_ID_ENV, "other"), (COLLECTOR_PORT_ENV, "1")]),
                || Some("host".into()),
            )
            .unwrap();
        assert_eq!(r.agent_id.as_str(), "prod/web-1");
        assert_eq!(r.collector_addr(), "collector.internal:9000");
    }

    #[test]
    fn falls_back_to_env_then_host_name_then_defaults() {
        let r = AgentSettings::default()
            .resolve_with(
                env(&[(AGENT_ID_ENV, "from-env"), (COLLECTOR_HOST_ENV, "10.0.0.5")]),
                || Some("box".into()),
            )
            .unwrap();
        assert_eq!(r.agent_id.as_str(), "from-env");
        assert_eq!(r.collector_host, "10.0.0.5");
        assert_eq!(r.collector_port, DEFAULT_COLLECTOR_PORT);

        let r = AgentSettings::default()
            .resolve_with(env(&[]), || Some("box".into()))
            .unwrap();
        assert_eq!(r.agent_id.as_str(), "box");
        assert_eq!(r.collector_addr(), "localhost:8181");

        let r = AgentSettings::default()
            .resolve_with(env(&[]), || None)
            .unwrap();
        assert_eq!(r.agent_id.as_str(), "unknown");
    }

    #[test]
    fn bad_port_env_is_an_error() {
        let err = AgentSettings::default()
            .resolve_with(env(&[(COLLECTOR_PORT_ENV, "eighty")]), || None)
            .unwrap_err();
        assert!(err.to_string().contains(COLLECTOR_PORT_ENV));
    }
}
