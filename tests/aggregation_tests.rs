// Aggregate store tests: ingestion, bucketed rollups, hierarchy propagation, summaries

mod common;

use apm_collector::aggregate_repo::{SummaryQuery, TransactionSummaryCollector};
use apm_collector::models::SummarySortOrder;
use apm_collector::rollup_schedule::RollupLevelConfig;
use common::*;

const LATER: i64 = 10_000_000;

fn summary_query(agent: &str, level: usize) -> SummaryQuery {
    SummaryQuery {
        agent_rollup: id(agent),
        transaction_type: "Web".into(),
        from: 0,
        to: 300_000,
        rollup_level: level,
    }
}

async fn overall_count(s: &TestStores, agent: &str, level: usize, to: i64) -> i64 {
    s.aggregates
        .read_overview_aggregates(&id(agent), "Web", 0, to, level)
        .await
        .unwrap()
        .iter()
        .map(|o| o.transaction_count)
        .sum()
}

#[tokio::test]
async fn hierarchy_rolls_up_to_grandparent() {
    let s = stores().await;
    let leaf = id("gp/p/leaf");
    let parent = id("gp/p");
    let grandparent = id("gp");

    s.aggregates
        .store(&leaf, 10_000, &one_two_seven(), &[])
        .await
        .unwrap();
    s.aggregates
        .store(&leaf, 20_000, &one_two_seven(), &[])
        .await
        .unwrap();

    s.aggregates
        .rollup_at(&leaf, Some(&parent), true, LATER)
        .await
        .unwrap();
    s.aggregates
        .rollup_at(&parent, Some(&grandparent), false, LATER)
        .await
        .unwrap();
    s.aggregates
        .rollup_at(&grandparent, None, false, LATER)
        .await
        .unwrap();

    for level in [1, 2] {
        let summaries = s
            .aggregates
            .merge_transaction_summaries(
                &summary_query("gp", level),
                SummarySortOrder::TotalTime,
                10,
            )
            .await
            .unwrap();
        let got: Vec<_> = summaries
            .iter()
            .map(|t| {
                (
                    t.transaction_name.as_str(),
                    t.total_duration_nanos,
                    t.transaction_count,
                )
            })
            .collect();
        assert_eq!(
            got,
            vec![
                ("seven", 2_800_000.0, 14),
                ("two", 600_000.0, 4),
                ("one", 200_000.0, 2),
            ],
            "level {level}"
        );
    }
}

#[tokio::test]
async fn rollup_preserves_transaction_count() {
    let s = stores().await;
    let agent = id("web-1");
    for (i, capture_time) in [5_000, 59_000, 61_000, 119_000, 240_000].into_iter().enumerate() {
        let batch = web_aggregates(&[("a", 1_000.0 * (i + 1) as f64, i as i64 + 1)]);
        s.aggregates
            .store(&agent, capture_time, &batch, &[])
            .await
            .unwrap();
    }
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();

    let raw = overall_count(&s, "web-1", 0, 300_000).await;
    assert_eq!(raw, 15);
    assert_eq!(overall_count(&s, "web-1", 1, 300_000).await, raw);
    assert_eq!(overall_count(&s, "web-1", 2, 300_000).await, raw);
    assert_eq!(s.aggregates.pending_rollups().await.unwrap(), 0);
}

#[tokio::test]
async fn redelivered_batch_is_stored_once() {
    let s = stores().await;
    let agent = id("web-1");
    for _ in 0..3 {
        s.aggregates
            .store(&agent, 10_000, &one_two_seven(), &["select 1".into()])
            .await
            .unwrap();
    }
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();
    // a fourth delivery after the bucket was rolled up re-marks and recomputes it
    s.aggregates
        .store(&agent, 10_000, &one_two_seven(), &["select 1".into()])
        .await
        .unwrap();
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();

    assert_eq!(overall_count(&s, "web-1", 0, 300_000).await, 10);
    assert_eq!(overall_count(&s, "web-1", 1, 300_000).await, 10);
    assert_eq!(overall_count(&s, "web-1", 2, 300_000).await, 10);
}

#[tokio::test]
async fn late_arrival_recomputes_closed_bucket() {
    let s = stores().await;
    let agent = id("web-1");
    s.aggregates
        .store(&agent, 10_000, &web_aggregates(&[("a", 100.0, 1)]), &[])
        .await
        .unwrap();
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();
    assert_eq!(overall_count(&s, "web-1", 1, 60_000).await, 1);

    s.aggregates
        .store(&agent, 30_000, &web_aggregates(&[("a", 100.0, 2)]), &[])
        .await
        .unwrap();
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();
    assert_eq!(overall_count(&s, "web-1", 1, 60_000).await, 3);
    assert_eq!(overall_count(&s, "web-1", 2, 300_000).await, 3);
}

#[tokio::test]
async fn open_bucket_is_not_rolled_up() {
    let s = stores().await;
    let agent = id("web-1");
    s.aggregates
        .store(&agent, 10_000, &one_two_seven(), &[])
        .await
        .unwrap();

    let written = s
        .aggregates
        .rollup_at(&agent, None, true, 59_999)
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert_eq!(s.aggregates.pending_rollups().await.unwrap(), 1);

    let written = s
        .aggregates
        .rollup_at(&agent, None, true, 60_000)
        .await
        .unwrap();
    // level 1: overall + three transactions; level 2 is still open
    assert_eq!(written, 4);
    assert_eq!(overall_count(&s, "web-1", 2, 300_000).await, 0);
}

#[tokio::test]
async fn sibling_agents_sum_at_parent() {
    let s = stores().await;
    let parent = id("prod");
    for agent in ["prod/web-1", "prod/web-2"] {
        s.aggregates
            .store(&id(agent), 10_000, &web_aggregates(&[("a", 500.0, 5)]), &[])
            .await
            .unwrap();
        s.aggregates
            .rollup_at(&id(agent), Some(&parent), true, LATER)
            .await
            .unwrap();
    }
    s.aggregates
        .rollup_at(&parent, None, false, LATER)
        .await
        .unwrap();
    assert_eq!(overall_count(&s, "prod", 1, 60_000).await, 10);
}

#[tokio::test]
async fn summaries_sort_by_count_and_truncate() {
    let s = stores().await;
    let agent = id("web-1");
    let batch = web_aggregates(&[("slow", 9_000_000.0, 1), ("busy", 10.0, 50), ("mid", 500.0, 5)]);
    s.aggregates.store(&agent, 1_000, &batch, &[]).await.unwrap();

    let query = SummaryQuery {
        agent_rollup: agent.clone(),
        transaction_type: "Web".into(),
        from: 0,
        to: 1_000,
        rollup_level: 0,
    };
    let by_count = s
        .aggregates
        .merge_transaction_summaries(&query, SummarySortOrder::TransactionCount, 2)
        .await
        .unwrap();
    let names: Vec<_> = by_count.iter().map(|t| t.transaction_name.as_str()).collect();
    assert_eq!(names, vec!["busy", "mid"]);

    // merging twice into one collector doubles every total
    let mut collector = TransactionSummaryCollector::new();
    s.aggregates
        .merge_in_transaction_summaries(&mut collector, &query)
        .await
        .unwrap();
    s.aggregates
        .merge_in_transaction_summaries(&mut collector, &query)
        .await
        .unwrap();
    let top = collector.get_result(SummarySortOrder::TotalTime, 1);
    assert_eq!(top[0].transaction_name, "slow");
    assert_eq!(top[0].transaction_count, 2);
}

#[tokio::test]
async fn overview_reports_percentiles_and_types() {
    let s = stores().await;
    let agent = id("web-1");
    s.aggregates
        .store(&agent, 1_000, &web_aggregates(&[("a", 4_000_000.0, 4)]), &[])
        .await
        .unwrap();
    let rows = s
        .aggregates
        .read_overview_aggregates(&agent, "Web", 0, 1_000, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].capture_time, 1_000);
    let p = rows[0].percentiles;
    assert!(p.p50_nanos >= 1_000_000 && p.p50_nanos < 1_200_000, "{p:?}");
    assert!(p.p50_nanos <= p.p95_nanos && p.p95_nanos <= p.p99_nanos);

    assert_eq!(
        s.aggregates.read_transaction_types(&agent, 0).await.unwrap(),
        vec!["Web".to_string()]
    );
}

#[tokio::test]
async fn expired_rows_are_pruned_per_level() {
    let levels = vec![
        RollupLevelConfig {
            capture_interval_millis: 1_000,
            view_threshold_millis: 0,
            expiration_hours: 1,
        },
        RollupLevelConfig {
            capture_interval_millis: 60_000,
            view_threshold_millis: 0,
            expiration_hours: 2,
        },
    ];
    let s = stores_with(&levels, 1).await;
    let agent = id("web-1");
    s.aggregates
        .store(&agent, 10_000, &one_two_seven(), &[])
        .await
        .unwrap();
    s.aggregates.rollup_at(&agent, None, true, LATER).await.unwrap();

    let hour = 3_600_000;
    // raw is past one hour, level 1 is inside two hours
    let deleted = s
        .aggregates
        .prune_expired(10_000 + hour + 1)
        .await
        .unwrap();
    assert_eq!(deleted, 4);
    assert_eq!(overall_count(&s, "web-1", 0, 60_000).await, 0);
    assert_eq!(overall_count(&s, "web-1", 1, 60_000).await, 10);
}
