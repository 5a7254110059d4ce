// Gauge store tests: name interning, weighted rollups, hierarchy, retention

mod common;

use common::*;

const LATER: i64 = 10_000_000;

#[tokio::test]
async fn equal_samples_roll_up_to_same_value_with_summed_weight() {
    let s = stores().await;
    let agent = id("web-1");
    s.gauges
        .store(
            &agent,
            &[gauge("heap", 10_000, 500.0), gauge("heap", 20_000, 500.0)],
        )
        .await
        .unwrap();
    s.gauges.rollup_at(&agent, None, true, LATER).await.unwrap();

    let rolled = s
        .gauges
        .read_gauge_values(&agent, "heap", 0, 60_000, 1)
        .await
        .unwrap();
    assert_eq!(rolled.len(), 1);
    assert_eq!(rolled[0].capture_time, 60_000);
    assert_eq!(rolled[0].value, 500.0);
    assert_eq!(rolled[0].weight, 2);
}

#[tokio::test]
async fn rolled_up_weights_carry_into_next_level() {
    let s = stores().await;
    let agent = id("web-1");
    s.gauges
        .store(
            &agent,
            &[
                gauge("cpu", 10_000, 10.0),
                gauge("cpu", 20_000, 20.0),
                gauge("cpu", 30_000, 30.0),
                gauge("cpu", 70_000, 90.0),
            ],
        )
        .await
        .unwrap();
    s.gauges.rollup_at(&agent, None, true, LATER).await.unwrap();

    let level1 = s
        .gauges
        .read_gauge_values(&agent, "cpu", 0, 300_000, 1)
        .await
        .unwrap();
    let points: Vec<_> = level1.iter().map(|g| (g.capture_time, g.value, g.weight)).collect();
    assert_eq!(points, vec![(60_000, 20.0, 3), (120_000, 90.0, 1)]);

    // weighted by sample count, not by bucket
    let level2 = s
        .gauges
        .read_gauge_values(&agent, "cpu", 0, 300_000, 2)
        .await
        .unwrap();
    assert_eq!(level2.len(), 1);
    assert_eq!(level2[0].value, 37.5);
    assert_eq!(level2[0].weight, 4);
}

#[tokio::test]
async fn parent_averages_children() {
    let s = stores().await;
    let parent = id("prod");
    s.gauges
        .store(&id("prod/a"), &[gauge("heap", 10_000, 100.0)])
        .await
        .unwrap();
    s.gauges
        .store(&id("prod/b"), &[gauge("heap", 10_000, 300.0)])
        .await
        .unwrap();
    for child in ["prod/a", "prod/b"] {
        s.gauges
            .rollup_at(&id(child), Some(&parent), true, LATER)
            .await
            .unwrap();
    }
    s.gauges.rollup_at(&parent, None, false, LATER).await.unwrap();

    let values = s
        .gauges
        .read_gauge_values(&parent, "heap", 0, 60_000, 1)
        .await
        .unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, 200.0);
    assert_eq!(values[0].weight, 2);
}

#[tokio::test]
async fn unknown_gauge_reads_empty() {
    let s = stores().await;
    let values = s
        .gauges
        .read_gauge_values(&id("web-1"), "nope", 0, LATER, 0)
        .await
        .unwrap();
    assert!(values.is_empty());
}

#[tokio::test]
async fn redelivered_samples_do_not_double_weight() {
    let s = stores().await;
    let agent = id("web-1");
    let batch = [gauge("heap", 10_000, 400.0), gauge("threads", 10_000, 12.0)];
    s.gauges.store(&agent, &batch).await.unwrap();
    s.gauges.store(&agent, &batch).await.unwrap();
    s.gauges.rollup_at(&agent, None, true, LATER).await.unwrap();

    let heap = s
        .gauges
        .read_gauge_values(&agent, "heap", 0, 60_000, 1)
        .await
        .unwrap();
    assert_eq!(heap[0].weight, 1);
    assert_eq!(
        s.gauges.read_gauge_names(&agent).await.unwrap(),
        vec!["heap".to_string(), "threads".to_string()]
    );
}

#[tokio::test]
async fn delete_all_forgets_names() {
    let s = stores().await;
    let agent = id("web-1");
    s.gauges
        .store(&agent, &[gauge("heap", 10_000, 1.0)])
        .await
        .unwrap();
    s.gauges.delete_all().await.unwrap();
    assert!(s.gauges.read_gauge_names(&agent).await.unwrap().is_empty());

    // the name is written again after the cache was invalidated
    s.gauges
        .store(&agent, &[gauge("heap", 20_000, 2.0)])
        .await
        .unwrap();
    let values = s
        .gauges
        .read_gauge_values(&agent, "heap", 0, 60_000, 0)
        .await
        .unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, 2.0);
}
