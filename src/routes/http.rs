// GET handlers: version, agent rollups, aggregates, gauges, traces

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::agent_rollup::AgentRollupId;
use crate::aggregate_repo::SummaryQuery;
use crate::models::SummarySortOrder;
use crate::version::{NAME, VERSION};

const DEFAULT_TOP_N: usize = 100;
const DEFAULT_TRACE_LIMIT: u32 = 200;

/// GET /version: returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// GET /api/agent-rollups: every known node, deepest first.
pub(super) async fn agent_rollups_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.agents.rollup_order().await?))
}

fn parse_agent_rollup(raw: &str) -> Result<AgentRollupId, ApiError> {
    AgentRollupId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Validates `from < to` and picks the level from the range when none is given.
fn resolve_level(
    state: &AppState,
    from: i64,
    to: i64,
    level: Option<usize>,
) -> Result<usize, ApiError> {
    if from >= to {
        return Err(ApiError::BadRequest(format!(
            "from ({from}) must be before to ({to})"
        )));
    }
    let max_level = state.schedule.max_level();
    match level {
        Some(level) if level > max_level => Err(ApiError::BadRequest(format!(
            "level {level} out of range 0..={max_level}"
        ))),
        Some(level) => Ok(level),
        None => Ok(state.schedule.level_for_range(from, to)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OverviewParams {
    agent_rollup: String,
    transaction_type: String,
    from: i64,
    to: i64,
    level: Option<usize>,
}

/// GET /api/aggregates/overview: overall time series of one transaction type.
pub(super) async fn overview_handler(
    State(state): State<AppState>,
    Query(params): Query<OverviewParams>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&params.agent_rollup)?;
    let level = resolve_level(&state, params.from, params.to, params.level)?;
    let rows = state
        .aggregates
        .read_overview_aggregates(
            &agent_rollup,
            &params.transaction_type,
            params.from,
            params.to,
            level,
        )
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SummaryParams {
    agent_rollup: String,
    transaction_type: String,
    from: i64,
    to: i64,
    level: Option<usize>,
    #[serde(default)]
    sort_order: SummarySortOrder,
    limit: Option<usize>,
}

/// GET /api/aggregates/summaries: top transactions by total time or count.
pub(super) async fn summaries_handler(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = SummaryQuery {
        agent_rollup: parse_agent_rollup(&params.agent_rollup)?,
        rollup_level: resolve_level(&state, params.from, params.to, params.level)?,
        transaction_type: params.transaction_type,
        from: params.from,
        to: params.to,
    };
    let summaries = state
        .aggregates
        .merge_transaction_summaries(
            &query,
            params.sort_order,
            params.limit.unwrap_or(DEFAULT_TOP_N),
        )
        .await?;
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AgentParams {
    agent_rollup: String,
    #[serde(default)]
    level: usize,
}

/// GET /api/aggregates/types: transaction types seen for an agent rollup.
pub(super) async fn transaction_types_handler(
    State(state): State<AppState>,
    Query(params): Query<AgentParams>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&params.agent_rollup)?;
    Ok(Json(
        state
            .aggregates
            .read_transaction_types(&agent_rollup, params.level)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct GaugeParams {
    agent_rollup: String,
    gauge_name: String,
    from: i64,
    to: i64,
    level: Option<usize>,
}

/// GET /api/gauges: one gauge's weighted samples.
pub(super) async fn gauge_values_handler(
    State(state): State<AppState>,
    Query(params): Query<GaugeParams>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&params.agent_rollup)?;
    let level = resolve_level(&state, params.from, params.to, params.level)?;
    let values = state
        .gauges
        .read_gauge_values(
            &agent_rollup,
            &params.gauge_name,
            params.from,
            params.to,
            level,
        )
        .await?;
    Ok(Json(values))
}

/// GET /api/gauges/names: gauges with stored samples for an agent rollup.
pub(super) async fn gauge_names_handler(
    State(state): State<AppState>,
    Query(params): Query<AgentParams>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&params.agent_rollup)?;
    Ok(Json(state.gauges.read_gauge_names(&agent_rollup).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TraceListParams {
    agent_rollup: String,
    from: i64,
    to: i64,
    limit: Option<u32>,
}

/// GET /api/traces: trace headers, newest first.
pub(super) async fn trace_headers_handler(
    State(state): State<AppState>,
    Query(params): Query<TraceListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&params.agent_rollup)?;
    let headers = state
        .traces
        .read_trace_headers(
            &agent_rollup,
            params.from,
            params.to,
            params.limit.unwrap_or(DEFAULT_TRACE_LIMIT),
        )
        .await?;
    Ok(Json(headers))
}

/// GET /api/traces/{agent_rollup}/{trace_id}: full trace. Use "::" between path segments.
pub(super) async fn trace_handler(
    State(state): State<AppState>,
    Path((agent_rollup, trace_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_rollup = parse_agent_rollup(&agent_rollup)?;
    match state.traces.read_trace(&agent_rollup, &trace_id).await? {
        Some(trace) => Ok(Json(trace)),
        None => Err(ApiError::NotFound(format!(
            "trace {trace_id} not found for {agent_rollup}"
        ))),
    }
}
