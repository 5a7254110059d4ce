// Wire protocol between agent and collector: JSON messages in length-delimited frames.
// Every request carries a correlation id so responses can be matched on a shared connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::agent_rollup::AgentRollupId;
use crate::models::{AgentConfig, AggregatesByType, GaugeValue, LogEvent, SystemInfo, Trace};

/// Default collector port used when nothing else is configured.
pub const DEFAULT_COLLECTOR_PORT: u16 = 8181;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Init {
        agent_id: AgentRollupId,
        system_info: SystemInfo,
        agent_config: AgentConfig,
    },
    CollectAggregates {
        agent_id: AgentRollupId,
        capture_time: i64,
        aggregates_by_type: Vec<AggregatesByType>,
        #[serde(default)]
        shared_query_texts: Vec<String>,
    },
    CollectGaugeValues {
        agent_id: AgentRollupId,
        gauge_values: Vec<GaugeValue>,
    },
    CollectTrace {
        agent_id: AgentRollupId,
        trace: Trace,
    },
    Log {
        agent_id: AgentRollupId,
        log_event: LogEvent,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "init",
            Request::CollectAggregates { .. } => "collect_aggregates",
            Request::CollectGaugeValues { .. } => "collect_gauge_values",
            Request::CollectTrace { .. } => "collect_trace",
            Request::Log { .. } => "log",
        }
    }

    pub fn agent_id(&self) -> &AgentRollupId {
        match self {
            Request::Init { agent_id, .. }
            | Request::CollectAggregates { agent_id, .. }
            | Request::CollectGaugeValues { agent_id, .. }
            | Request::CollectTrace { agent_id, .. }
            | Request::Log { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Init {
        updated_agent_config: Option<AgentConfig>,
    },
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerErrorKind {
    /// The payload failed validation; resending it cannot succeed.
    Invalid,
    /// The collector could not store the payload right now.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::Invalid,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::Internal,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub result: Result<Response, ServerError>,
}

pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Bytes> {
    serde_json::to_vec(message).map(Bytes::from)
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(frame)
}
