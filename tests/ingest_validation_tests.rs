// Ingest handler tests for payloads that can never be stored: out-of-range values,
// oversized blobs, and agent ids that collide with the rollup hierarchy

mod common;

use apm_collector::aggregate_repo::SummaryQuery;
use apm_collector::models::{
    Aggregate, AggregatesByType, GaugeValue, MAX_CAPTURE_TIME, MAX_COUNT, SummarySortOrder,
};
use apm_collector::rollup_worker;
use apm_collector::transport::protocol::{ServerError, ServerErrorKind};
use apm_collector::transport::{Request, Response};
use common::*;

fn collect_aggregates(agent: &str, capture_time: i64) -> Request {
    Request::CollectAggregates {
        agent_id: id(agent),
        capture_time,
        aggregates_by_type: one_two_seven(),
        shared_query_texts: vec![],
    }
}

fn assert_invalid(result: Result<Response, ServerError>) {
    match result {
        Err(e) => assert_eq!(e.kind, ServerErrorKind::Invalid, "{}", e.message),
        Ok(r) => panic!("expected rejection, got {r:?}"),
    }
}

#[tokio::test]
async fn grouping_id_cannot_report_and_keeps_child_data() {
    let s = stores().await;
    let service = s.service();
    assert_eq!(
        service.handle(collect_aggregates("prod/web-1", 10_000)).await,
        Ok(Response::Empty)
    );
    assert_invalid(service.handle(collect_aggregates("prod", 10_000)).await);

    let summary = rollup_worker::run_one_tick(&s.worker_deps(), 10_000_000)
        .await
        .unwrap();
    assert_eq!(summary.failed_nodes, 0);

    let query = SummaryQuery {
        agent_rollup: id("prod"),
        transaction_type: "Web".into(),
        from: 0,
        to: 300_000,
        rollup_level: 2,
    };
    let top = s
        .aggregates
        .merge_transaction_summaries(&query, SummarySortOrder::TransactionCount, 3)
        .await
        .unwrap();
    let total: i64 = top.iter().map(|t| t.transaction_count).sum();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn reporting_agent_cannot_become_a_grouping() {
    let s = stores().await;
    let service = s.service();
    assert_eq!(
        service.handle(collect_aggregates("prod", 10_000)).await,
        Ok(Response::Empty)
    );
    assert_invalid(
        service
            .handle(Request::CollectGaugeValues {
                agent_id: id("prod/web-1"),
                gauge_values: vec![gauge("heap", 10_000, 1.0)],
            })
            .await,
    );
    assert_eq!(s.agents.rollup_order().await.unwrap().len(), 1);
}

#[tokio::test]
async fn capture_time_out_of_range_is_invalid() {
    let s = stores().await;
    let service = s.service();
    assert_invalid(service.handle(collect_aggregates("web-1", i64::MAX)).await);
    assert_invalid(service.handle(collect_aggregates("web-1", 0)).await);
    assert_invalid(
        service
            .handle(Request::CollectGaugeValues {
                agent_id: id("web-1"),
                gauge_values: vec![gauge("heap", MAX_CAPTURE_TIME + 1, 1.0)],
            })
            .await,
    );

    // the last representable millisecond is still accepted and rolls up
    assert_eq!(
        service
            .handle(collect_aggregates("web-1", MAX_CAPTURE_TIME))
            .await,
        Ok(Response::Empty)
    );
    let summary = rollup_worker::run_one_tick(&s.worker_deps(), MAX_CAPTURE_TIME + 1_000_000)
        .await
        .unwrap();
    assert_eq!(summary.failed_nodes, 0);
}

#[tokio::test]
async fn counts_and_weights_past_the_cap_are_invalid() {
    let s = stores().await;
    let service = s.service();
    assert_invalid(
        service
            .handle(Request::CollectGaugeValues {
                agent_id: id("web-1"),
                gauge_values: vec![GaugeValue {
                    weight: i64::MAX,
                    ..gauge("heap", 10_000, 1.0)
                }],
            })
            .await,
    );
    assert_invalid(
        service
            .handle(Request::CollectAggregates {
                agent_id: id("web-1"),
                capture_time: 10_000,
                aggregates_by_type: vec![AggregatesByType {
                    transaction_type: "Web".into(),
                    overall: Aggregate {
                        transaction_count: i64::MAX,
                        ..Aggregate::default()
                    },
                    transactions: vec![],
                }],
                shared_query_texts: vec![],
            })
            .await,
    );
}

#[tokio::test]
async fn heaviest_accepted_gauges_roll_up() {
    let s = stores().await;
    let service = s.service();
    for (agent, value) in [("prod/web-1", 2.0), ("prod/web-2", 4.0)] {
        let heavy = |capture_time| GaugeValue {
            weight: MAX_COUNT,
            ..gauge("heap", capture_time, value)
        };
        assert_eq!(
            service
                .handle(Request::CollectGaugeValues {
                    agent_id: id(agent),
                    gauge_values: vec![heavy(10_000), heavy(20_000)],
                })
                .await,
            Ok(Response::Empty)
        );
    }

    let summary = rollup_worker::run_one_tick(&s.worker_deps(), 10_000_000)
        .await
        .unwrap();
    assert_eq!(summary.failed_nodes, 0);

    let heap = s
        .gauges
        .read_gauge_values(&id("prod"), "heap", 0, 300_000, 2)
        .await
        .unwrap();
    assert_eq!(heap.len(), 1);
    assert_eq!(heap[0].value, 3.0);
    assert_eq!(heap[0].weight, 4 * MAX_COUNT);
}

#[tokio::test]
async fn oversized_query_texts_are_invalid() {
    let s = stores().await;
    let result = s
        .service()
        .handle(Request::CollectAggregates {
            agent_id: id("web-1"),
            capture_time: 10_000,
            aggregates_by_type: one_two_seven(),
            shared_query_texts: vec!["x".repeat(17 * 1024 * 1024)],
        })
        .await;
    assert_invalid(result);
    assert!(
        s.aggregates
            .read_overview_aggregates(&id("web-1"), "Web", 0, 20_000, 0)
            .await
            .unwrap()
            .is_empty()
    );
}
