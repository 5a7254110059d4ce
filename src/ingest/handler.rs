// Request dispatch: validate, register the agent, hand the payload to its store.

use std::sync::Arc;

use tracing::{Level, debug, error, event, warn};

use crate::agent_repo::AgentRepo;
use crate::agent_rollup::AgentRollupId;
use crate::aggregate_repo::AggregateRepo;
use crate::error::StoreError;
use crate::gauge_repo::GaugeRepo;
use crate::models::{LogLevel, validate_capture_time};
use crate::trace_repo::TraceRepo;
use crate::transport::protocol::{Request, Response, ServerError};

/// The stores an ingest connection writes into.
#[derive(Clone)]
pub struct CollectorService {
    pub agents: Arc<AgentRepo>,
    pub aggregates: Arc<AggregateRepo>,
    pub gauges: Arc<GaugeRepo>,
    pub traces: Arc<TraceRepo>,
}

impl CollectorService {
    /// Applies one request. Every request is idempotent, so a redelivered payload
    /// leaves the stores as they were after the first delivery.
    pub async fn handle(&self, request: Request) -> Result<Response, ServerError> {
        let operation = request.name();
        let agent_id = request.agent_id().clone();
        if let Err(message) = validate(&request) {
            warn!(agent_id = %agent_id, operation, reason = %message, "rejecting invalid payload");
            return Err(ServerError::invalid(message));
        }

        let result = match request {
            Request::Init {
                agent_id,
                system_info,
                agent_config,
            } => self
                .agents
                .store_init(&agent_id, &system_info, &agent_config)
                .await
                .map(|updated_agent_config| Response::Init {
                    updated_agent_config,
                }),
            Request::CollectAggregates {
                agent_id,
                capture_time,
                aggregates_by_type,
                shared_query_texts,
            } => {
                self.register(&agent_id).await?;
                self.aggregates
                    .store(&agent_id, capture_time, &aggregates_by_type, &shared_query_texts)
                    .await
                    .map(|()| Response::Empty)
            }
            Request::CollectGaugeValues {
                agent_id,
                gauge_values,
            } => {
                self.register(&agent_id).await?;
                self.gauges
                    .store(&agent_id, &gauge_values)
                    .await
                    .map(|()| Response::Empty)
            }
            Request::CollectTrace { agent_id, trace } => {
                self.register(&agent_id).await?;
                self.traces
                    .store(&agent_id, &trace)
                    .await
                    .map(|()| Response::Empty)
            }
            Request::Log {
                agent_id,
                log_event,
            } => {
                let fields = render_fields(&log_event.fields);
                macro_rules! agent_log {
                    ($level:expr) => {
                        event!(
                            target: "agent",
                            $level,
                            agent_id = %agent_id,
                            logger = %log_event.logger_name,
                            timestamp = log_event.timestamp,
                            fields = %fields,
                            "{}",
                            log_event.message
                        )
                    };
                }
                match log_event.level {
                    LogLevel::Error => agent_log!(Level::ERROR),
                    LogLevel::Warn => agent_log!(Level::WARN),
                    LogLevel::Info => agent_log!(Level::INFO),
                    LogLevel::Debug | LogLevel::Trace => agent_log!(Level::DEBUG),
                }
                Ok(Response::Empty)
            }
        };

        result.map_err(|e| store_failure(&agent_id, operation, e))
    }

    async fn register(&self, agent_id: &AgentRollupId) -> Result<(), ServerError> {
        self.agents
            .register(agent_id)
            .await
            .map_err(|e| store_failure(agent_id, "register", e))
    }
}

fn store_failure(
    agent_id: &AgentRollupId,
    operation: &'static str,
    e: StoreError,
) -> ServerError {
    if e.is_payload_error() {
        warn!(agent_id = %agent_id, operation, reason = %e, "rejecting unstorable payload");
        return ServerError::invalid(format!("{operation}: {e}"));
    }
    if e.is_fatal() {
        error!(agent_id = %agent_id, operation, error = %e, "store failed");
    } else {
        debug!(agent_id = %agent_id, operation, error = %e, "store temporarily unavailable");
    }
    ServerError::internal(format!("{operation}: {e}"))
}

fn validate(request: &Request) -> Result<(), String> {
    match request {
        Request::Init { .. } | Request::Log { .. } => Ok(()),
        Request::CollectAggregates {
            capture_time,
            aggregates_by_type,
            ..
        } => {
            validate_capture_time(*capture_time)?;
            aggregates_by_type
                .iter()
                .try_for_each(|a| a.validate())
        }
        Request::CollectGaugeValues { gauge_values, .. } => {
            for v in gauge_values {
                validate_capture_time(v.capture_time)
                    .map_err(|e| format!("gauge {}: {e}", v.gauge_name))?;
                v.validate()?;
            }
            Ok(())
        }
        Request::CollectTrace { trace, .. } => trace.validate(),
    }
}

fn render_fields(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}
