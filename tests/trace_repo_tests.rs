// Trace store tests: redelivery and out-of-range durations

mod common;

use apm_collector::models::TraceAttribute;
use common::*;

#[tokio::test]
async fn redelivered_trace_replaces_its_attributes() {
    let s = stores().await;
    let agent = id("web-1");
    let mut first = trace("t-1", 10_000);
    first.attributes.push(TraceAttribute {
        name: "tier".into(),
        values: vec!["gold".into()],
    });
    s.traces.store(&agent, &first).await.unwrap();
    assert_eq!(
        s.traces
            .find_trace_ids_by_attribute(&agent, "tier", "gold")
            .await
            .unwrap(),
        vec!["t-1".to_string()]
    );

    s.traces.store(&agent, &trace("t-1", 10_000)).await.unwrap();
    assert!(
        s.traces
            .find_trace_ids_by_attribute(&agent, "tier", "gold")
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        s.traces
            .find_trace_ids_by_attribute(&agent, "region", "eu-west")
            .await
            .unwrap(),
        vec!["t-1".to_string()]
    );
}

#[tokio::test]
async fn duration_beyond_i64_is_rejected() {
    let s = stores().await;
    let agent = id("web-1");
    let mut t = trace("t-1", 10_000);
    t.duration_nanos = u64::MAX;
    let err = s.traces.store(&agent, &t).await.unwrap_err();
    assert!(err.is_payload_error(), "{err}");
    assert!(s.traces.read_trace(&agent, "t-1").await.unwrap().is_none());
}
