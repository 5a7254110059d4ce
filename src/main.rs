use anyhow::Result;
use apm_collector::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    let schedule = Arc::new(app_config.rollup_schedule()?);

    let pool = db::connect(&app_config.database.path, app_config.database.max_pool_size).await?;
    let blobs = Arc::new(blob_store::SqliteBlobStore::new(pool.clone()));
    blobs.init().await?;
    let agents = Arc::new(agent_repo::AgentRepo::new(pool.clone()));
    agents.init().await?;
    let aggregates = Arc::new(aggregate_repo::AggregateRepo::new(
        pool.clone(),
        blobs.clone(),
        schedule.clone(),
    ));
    aggregates.init().await?;
    let gauges = Arc::new(gauge_repo::GaugeRepo::new(pool.clone(), schedule.clone()));
    gauges.init().await?;
    let traces = Arc::new(trace_repo::TraceRepo::new(
        pool.clone(),
        blobs.clone(),
        app_config.database.trace_retention_hours,
    ));
    traces.init().await?;

    let shutdown = CancellationToken::new();

    let worker_handle = rollup_worker::spawn(
        rollup_worker::RollupWorkerDeps {
            pool: pool.clone(),
            agents: agents.clone(),
            aggregates: aggregates.clone(),
            gauges: gauges.clone(),
            traces: traces.clone(),
            blobs,
        },
        rollup_worker::RollupWorkerConfig {
            interval_secs: app_config.rollup.interval_secs,
            vacuum_schedule: app_config.rollup.vacuum_schedule.clone(),
            vacuum_interval_secs: app_config.rollup.vacuum_interval_secs,
        },
        shutdown.child_token(),
    );

    let ingest_addr = format!("{}:{}", app_config.collector.host, app_config.collector.port);
    let ingest = ingest::IngestServer::bind(
        &ingest_addr,
        ingest::CollectorService {
            agents: agents.clone(),
            aggregates: aggregates.clone(),
            gauges: gauges.clone(),
            traces: traces.clone(),
        },
        app_config.collector.max_frame_bytes,
    )
    .await?;
    let ingest_shutdown = ingest.shutdown_token();
    let ingest_handle = tokio::spawn(ingest.run());

    let app = routes::app(routes::AppState {
        agents,
        aggregates,
        gauges,
        traces,
        schedule,
    });
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
        }
    }

    shutdown.cancel();
    ingest_shutdown.cancel();
    match ingest_handle.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "ingest listener did not drain"),
        Err(e) => tracing::warn!(error = %e, "ingest listener task failed"),
        Ok(Ok(())) => {}
    }
    let _ = worker_handle.await;
    pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
