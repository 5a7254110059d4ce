// Background worker: roll every agent rollup up through the schedule, then prune.
// Runs every interval_secs. Deepest nodes go first so a parent reads finished children.
// VACUUM runs on a configurable schedule (cron expression or fixed interval).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent_repo::AgentRepo;
use crate::aggregate_repo::AggregateRepo;
use crate::blob_store::SqliteBlobStore;
use crate::gauge_repo::GaugeRepo;
use crate::trace_repo::TraceRepo;

/// Config for the rollup worker.
#[derive(Debug, Clone)]
pub struct RollupWorkerConfig {
    pub interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    pub vacuum_interval_secs: u64,
}

/// Stores the worker rolls up and prunes.
#[derive(Clone)]
pub struct RollupWorkerDeps {
    pub pool: SqlitePool,
    pub agents: Arc<AgentRepo>,
    pub aggregates: Arc<AggregateRepo>,
    pub gauges: Arc<GaugeRepo>,
    pub traces: Arc<TraceRepo>,
    pub blobs: Arc<SqliteBlobStore>,
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub aggregate_rows: usize,
    pub gauge_rows: usize,
    pub failed_nodes: usize,
    pub pruned_rows: u64,
}

/// Spawns the rollup worker. It stops between passes once `cancel` fires.
pub fn spawn(
    deps: RollupWorkerDeps,
    config: RollupWorkerConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(deps, config, cancel).await;
    })
}

#[instrument(skip(deps, config, cancel), fields(interval_secs = config.interval_secs))]
async fn run(deps: RollupWorkerDeps, config: RollupWorkerConfig, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(config.interval_secs));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (vacuum_tx, mut vacuum_rx) = tokio::sync::mpsc::channel::<()>(1);
    let vacuum_task = tokio::spawn(vacuum_scheduler(config.clone(), vacuum_tx));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = run_one_tick(&deps, crate::db::now_millis()).await {
                    warn!(error = %e, "rollup tick failed");
                }
            }
            _ = vacuum_rx.recv() => {
                if let Err(e) = crate::db::vacuum(&deps.pool).await {
                    warn!(error = %e, "vacuum failed");
                } else {
                    info!("vacuum complete");
                }
            }
        }
    }
    vacuum_task.abort();
    deps.gauges.close();
    deps.traces.close();
    info!("rollup worker stopped");
}

/// Sends a message on `tx` at each VACUUM time (cron or fixed interval). Uses local time for cron.
async fn vacuum_scheduler(config: RollupWorkerConfig, tx: tokio::sync::mpsc::Sender<()>) {
    if let Some(ref cron_str) = config.vacuum_schedule {
        let Ok(schedule) = cron::Schedule::from_str(cron_str) else {
            warn!(cron = %cron_str, "invalid vacuum_schedule; VACUUM will not run");
            return;
        };
        loop {
            let now = chrono::Local::now();
            let next = schedule.after(&now).next();
            if let Some(next) = next {
                let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(delay).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            } else {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    } else {
        let interval = Duration::from_secs(config.vacuum_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    }
}

/// One pass: roll up every node (failures are logged per node and skipped), then prune.
pub async fn run_one_tick(deps: &RollupWorkerDeps, now: i64) -> anyhow::Result<TickSummary> {
    let mut summary = TickSummary::default();

    for node in deps.agents.rollup_order().await? {
        let parent = node.parent.as_ref();
        match deps.aggregates.rollup_at(&node.id, parent, node.leaf, now).await {
            Ok(rows) => summary.aggregate_rows += rows,
            Err(e) => {
                warn!(agent_rollup = %node.id, fatal = e.is_fatal(), error = %e, "aggregate rollup failed");
                summary.failed_nodes += 1;
            }
        }
        match deps.gauges.rollup_at(&node.id, parent, node.leaf, now).await {
            Ok(rows) => summary.gauge_rows += rows,
            Err(e) => {
                warn!(agent_rollup = %node.id, fatal = e.is_fatal(), error = %e, "gauge rollup failed");
                summary.failed_nodes += 1;
            }
        }
    }

    if summary.aggregate_rows > 0 || summary.gauge_rows > 0 {
        info!(
            aggregate_rows = summary.aggregate_rows,
            gauge_rows = summary.gauge_rows,
            "rollup pass"
        );
    }

    summary.pruned_rows += deps.aggregates.prune_expired(now).await?;
    summary.pruned_rows += deps.gauges.prune_expired(now).await?;
    summary.pruned_rows += deps.traces.prune_expired(now).await?;

    // blobs outlive every row that can reference them
    let schedule_horizon = deps.aggregates.schedule().max_expiration_millis();
    let trace_horizon = deps.traces.retention_millis();
    if let (Some(a), Some(t)) = (schedule_horizon, trace_horizon) {
        let blobs = deps.blobs.prune_older_than(now - a.max(t)).await?;
        if blobs > 0 {
            debug!(blobs, "pruned blobs");
        }
    }

    Ok(summary)
}
