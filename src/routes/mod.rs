// HTTP routes: read-only query API over the collector stores

mod http;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::agent_repo::AgentRepo;
use crate::aggregate_repo::AggregateRepo;
use crate::error::StoreError;
use crate::gauge_repo::GaugeRepo;
use crate::rollup_schedule::RollupSchedule;
use crate::trace_repo::TraceRepo;

#[derive(Clone)]
pub struct AppState {
    pub agents: Arc<AgentRepo>,
    pub aggregates: Arc<AggregateRepo>,
    pub gauges: Arc<GaugeRepo>,
    pub traces: Arc<TraceRepo>,
    pub schedule: Arc<RollupSchedule>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/agent-rollups", get(http::agent_rollups_handler)) // GET /api/agent-rollups
        .route(
            "/api/aggregates/overview",
            get(http::overview_handler), // GET /api/aggregates/overview
        )
        .route(
            "/api/aggregates/summaries",
            get(http::summaries_handler), // GET /api/aggregates/summaries
        )
        .route(
            "/api/aggregates/types",
            get(http::transaction_types_handler), // GET /api/aggregates/types
        )
        .route("/api/gauges", get(http::gauge_values_handler)) // GET /api/gauges
        .route("/api/gauges/names", get(http::gauge_names_handler)) // GET /api/gauges/names
        .route("/api/traces", get(http::trace_headers_handler)) // GET /api/traces
        .route(
            "/api/traces/{agent_rollup}/{trace_id}",
            get(http::trace_handler), // GET /api/traces/{agent_rollup}/{trace_id}
        )
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Store(e) => {
                error!(error = %e, "query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
