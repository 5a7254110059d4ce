// Shared test helpers
#![allow(dead_code)]

use std::sync::Arc;

use apm_collector::agent_repo::AgentRepo;
use apm_collector::agent_rollup::AgentRollupId;
use apm_collector::aggregate_repo::AggregateRepo;
use apm_collector::blob_store::SqliteBlobStore;
use apm_collector::gauge_repo::GaugeRepo;
use apm_collector::ingest::CollectorService;
use apm_collector::models::*;
use apm_collector::rollup_schedule::{NEVER_EXPIRE_HOURS, RollupLevelConfig, RollupSchedule};
use apm_collector::rollup_worker::RollupWorkerDeps;
use apm_collector::trace_repo::TraceRepo;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Every store on one temp-dir database. Keep the struct alive for the test's duration.
pub struct TestStores {
    pub _dir: TempDir,
    pub pool: SqlitePool,
    pub schedule: Arc<RollupSchedule>,
    pub blobs: Arc<SqliteBlobStore>,
    pub agents: Arc<AgentRepo>,
    pub aggregates: Arc<AggregateRepo>,
    pub gauges: Arc<GaugeRepo>,
    pub traces: Arc<TraceRepo>,
}

impl TestStores {
    pub fn service(&self) -> CollectorService {
        CollectorService {
            agents: self.agents.clone(),
            aggregates: self.aggregates.clone(),
            gauges: self.gauges.clone(),
            traces: self.traces.clone(),
        }
    }

    pub fn worker_deps(&self) -> RollupWorkerDeps {
        RollupWorkerDeps {
            pool: self.pool.clone(),
            agents: self.agents.clone(),
            aggregates: self.aggregates.clone(),
            gauges: self.gauges.clone(),
            traces: self.traces.clone(),
            blobs: self.blobs.clone(),
        }
    }
}

/// Raw at 1 s, then 1 min and 5 min. Nothing expires.
pub fn never_expire_levels() -> Vec<RollupLevelConfig> {
    [1_000, 60_000, 300_000]
        .into_iter()
        .map(|capture_interval_millis| RollupLevelConfig {
            capture_interval_millis,
            view_threshold_millis: 0,
            expiration_hours: NEVER_EXPIRE_HOURS,
        })
        .collect()
}

pub async fn stores() -> TestStores {
    stores_with(&never_expire_levels(), NEVER_EXPIRE_HOURS).await
}

pub async fn stores_with(levels: &[RollupLevelConfig], trace_retention_hours: u32) -> TestStores {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("collector.db");
    let pool = apm_collector::db::connect(path.to_str().unwrap(), 4)
        .await
        .unwrap();
    let schedule = Arc::new(RollupSchedule::new(levels).unwrap());

    let blobs = Arc::new(SqliteBlobStore::new(pool.clone()));
    blobs.init().await.unwrap();
    let agents = Arc::new(AgentRepo::new(pool.clone()));
    agents.init().await.unwrap();
    let aggregates = Arc::new(AggregateRepo::new(
        pool.clone(),
        blobs.clone(),
        schedule.clone(),
    ));
    aggregates.init().await.unwrap();
    let gauges = Arc::new(GaugeRepo::new(pool.clone(), schedule.clone()));
    gauges.init().await.unwrap();
    let traces = Arc::new(TraceRepo::new(
        pool.clone(),
        blobs.clone(),
        trace_retention_hours,
    ));
    traces.init().await.unwrap();

    TestStores {
        _dir: dir,
        pool,
        schedule,
        blobs,
        agents,
        aggregates,
        gauges,
        traces,
    }
}

pub fn id(raw: &str) -> AgentRollupId {
    AgentRollupId::parse(raw).unwrap()
}

pub fn aggregate(total_duration_nanos: f64, transaction_count: i64) -> Aggregate {
    let mut duration_histogram = DurationHistogram::new();
    if transaction_count > 0 {
        let each = (total_duration_nanos / transaction_count as f64) as u64;
        duration_histogram.record_n(each, transaction_count as u64);
    }
    Aggregate {
        total_duration_nanos,
        error_count: 0,
        transaction_count,
        duration_histogram,
    }
}

/// One "Web" type holding `(name, total nanos, count)` transactions; the overall row sums them.
pub fn web_aggregates(transactions: &[(&str, f64, i64)]) -> Vec<AggregatesByType> {
    let mut overall = Aggregate::default();
    let transactions = transactions
        .iter()
        .map(|(name, total, count)| {
            let a = aggregate(*total, *count);
            overall.total_duration_nanos += a.total_duration_nanos;
            overall.transaction_count += a.transaction_count;
            overall.duration_histogram.merge(&a.duration_histogram);
            TransactionAggregate {
                transaction_name: name.to_string(),
                aggregate: a,
            }
        })
        .collect();
    vec![AggregatesByType {
        transaction_type: "Web".into(),
        overall,
        transactions,
    }]
}

/// The three transactions used by the hierarchy tests.
pub fn one_two_seven() -> Vec<AggregatesByType> {
    web_aggregates(&[
        ("one", 100_000.0, 1),
        ("two", 300_000.0, 2),
        ("seven", 1_400_000.0, 7),
    ])
}

pub fn gauge(name: &str, capture_time: i64, value: f64) -> GaugeValue {
    GaugeValue {
        gauge_name: name.into(),
        capture_time,
        value,
        weight: 1,
    }
}

pub fn trace(id: &str, capture_time: i64) -> Trace {
    Trace {
        id: id.into(),
        transaction_type: "Web".into(),
        transaction_name: "/checkout".into(),
        start_time: capture_time - 250,
        capture_time,
        duration_nanos: 250_000_000,
        headline: "POST /checkout".into(),
        user: "alice".into(),
        error: false,
        error_message: String::new(),
        attributes: vec![TraceAttribute {
            name: "region".into(),
            values: vec!["eu-west".into()],
        }],
        entries: vec![TraceEntry {
            depth: 0,
            start_offset_nanos: 0,
            duration_nanos: 250_000_000,
            message: "jdbc query".into(),
        }],
    }
}

pub fn system_info(host: &str) -> SystemInfo {
    SystemInfo {
        host_name: host.into(),
        os_name: "Linux".into(),
        logical_cores: 4,
        agent_version: "0.1.0".into(),
        ..Default::default()
    }
}
