// tests/stream_consumer.rs
use std::sync::Arc;
use std::time::Duration;

use live_dashboard::registry::{transforms, MetricSource, SourceRegistry};
use live_dashboard::sse::SseEvent;
use live_dashboard::stream::RECONNECTING;
use live_dashboard::testing::{ScriptedConnector, ScriptedGateway};
use live_dashboard::{Dashboard, DashboardContext, DashboardSetup};
use serde_json::json;

const WEEKLY: &str = "http://backend.test/api/visits/weekly/stream";
const ALL: &str = "http://backend.test/api/visits/stream";

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn start(conn: &Arc<ScriptedConnector>) -> Dashboard {
    let ctx = DashboardContext::new(Arc::new(ScriptedGateway::new()), conn.clone());
    let sources = vec![
        MetricSource::stream("weekly_visits", WEEKLY, transforms::count("count")),
        MetricSource::stream("all_visits", ALL, transforms::series("visits")),
    ];
    Dashboard::start(
        ctx,
        DashboardSetup {
            sources: SourceRegistry::new(sources).unwrap(),
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn latest_message_replaces_value() {
    let conn = Arc::new(ScriptedConnector::new());
    let dash = start(&conn);
    settle().await;

    let st = dash.metric("weekly_visits").unwrap();
    assert!(st.connected);
    assert!(!st.loading);

    assert!(conn.send(WEEKLY, SseEvent::message(r#"{"count": 41}"#)));
    assert!(conn.send(WEEKLY, SseEvent::message(r#"{"count": 42}"#)));
    assert!(conn.send(ALL, SseEvent::message(r#"{"visits": [{"day": "mon", "n": 3}]}"#)));
    settle().await;

    assert_eq!(dash.metric("weekly_visits").unwrap().value, Some(json!(42)));
    assert_eq!(
        dash.metric("all_visits").unwrap().value,
        Some(json!([{"day": "mon", "n": 3}]))
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_recorded_without_closing() {
    let conn = Arc::new(ScriptedConnector::new());
    let dash = start(&conn);
    settle().await;

    conn.send(WEEKLY, SseEvent::message(r#"{"count": 7}"#));
    conn.send(WEEKLY, SseEvent::message("not json"));
    settle().await;

    let st = dash.metric("weekly_visits").unwrap();
    assert_eq!(st.value, Some(json!(7)));
    assert!(st.error.is_some());
    assert!(st.connected);
    assert!(conn.is_open(WEEKLY));

    // heartbeats and unknown events change nothing
    let before = dash.metric("weekly_visits").unwrap();
    conn.send(WEEKLY, SseEvent::named("heartbeat", ""));
    conn.send(WEEKLY, SseEvent::named("something-else", "{}"));
    settle().await;
    assert_eq!(dash.metric("weekly_visits").unwrap(), before);

    conn.send(WEEKLY, SseEvent::message(r#"{"count": 8}"#));
    settle().await;
    let st = dash.metric("weekly_visits").unwrap();
    assert_eq!(st.value, Some(json!(8)));
    assert_eq!(st.error, None);
    assert_eq!(conn.opened(WEEKLY).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_exactly_the_fixed_delay() {
    let conn = Arc::new(ScriptedConnector::new());
    let dash = start(&conn);
    settle().await;
    conn.send(WEEKLY, SseEvent::message(r#"{"count": 1}"#));
    settle().await;

    assert!(conn.fail(WEEKLY, "connection reset"));
    settle().await;

    let st = dash.metric("weekly_visits").unwrap();
    assert!(!st.connected);
    assert_eq!(st.error.as_deref(), Some(RECONNECTING));
    assert_eq!(st.value, Some(json!(1)), "value survives the disconnect");
    // the sibling stream is unaffected
    assert!(dash.metric("all_visits").unwrap().connected);

    tokio::time::advance(Duration::from_millis(4_999)).await;
    settle().await;
    assert_eq!(conn.attempts(WEEKLY).len(), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    let attempts = conn.attempts(WEEKLY);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].1 - attempts[0].1, Duration::from_secs(5));

    let st = dash.metric("weekly_visits").unwrap();
    assert!(st.connected);
    assert_eq!(st.error, None);
}

#[tokio::test(start_paused = true)]
async fn retries_forever_including_refused_connects_and_clean_closes() {
    let conn = Arc::new(ScriptedConnector::new());
    let _dash = start(&conn);
    settle().await;

    // server closes the stream cleanly: still a reconnect
    assert!(conn.close(WEEKLY));
    for _ in 0..3 {
        conn.refuse_next(WEEKLY, "503 from proxy");
    }
    settle().await;

    for expected in 2..=5 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(conn.attempts(WEEKLY).len(), expected);
    }
    // three refusals, then the fourth reconnect opened a session
    assert_eq!(conn.opened(WEEKLY).len(), 2);
    assert!(conn.is_open(WEEKLY));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_connections_and_is_idempotent() {
    let conn = Arc::new(ScriptedConnector::new());
    let dash = start(&conn);
    settle().await;
    conn.send(WEEKLY, SseEvent::message(r#"{"count": 3}"#));
    settle().await;

    dash.shutdown();
    dash.shutdown();
    settle().await;

    assert!(!conn.is_open(WEEKLY));
    assert!(!conn.is_open(ALL));
    assert!(!conn.send(WEEKLY, SseEvent::message(r#"{"count": 4}"#)));

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(conn.attempts(WEEKLY).len(), 1, "no reconnect after teardown");
    assert_eq!(dash.metric("weekly_visits").unwrap().value, Some(json!(3)));
}
