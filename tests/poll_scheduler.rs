// tests/poll_scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use live_dashboard::registry::{transforms, MetricSource, SourceRegistry};
use live_dashboard::testing::{ScriptedConnector, ScriptedGateway};
use live_dashboard::{Dashboard, DashboardContext, DashboardSetup};
use serde_json::json;

const USERS: &str = "http://backend.test/api/users/count";
const PROJECTS: &str = "http://backend.test/api/projects/count";

/// Let spawned drivers run without moving the (paused) clock.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn poll(name: &str, url: &str, secs: u64) -> MetricSource {
    MetricSource::poll(name, url, Duration::from_secs(secs), transforms::count("count"))
}

fn start(gw: &Arc<ScriptedGateway>, sources: Vec<MetricSource>) -> Dashboard {
    let ctx = DashboardContext::new(gw.clone(), Arc::new(ScriptedConnector::new()));
    Dashboard::start(
        ctx,
        DashboardSetup {
            sources: SourceRegistry::new(sources).expect("valid registry"),
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn failing_source_leaves_siblings_untouched() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_json(USERS, json!({"count": 3}));
    gw.set_error(PROJECTS, "connection refused");

    let dash = start(&gw, vec![poll("users", USERS, 30), poll("projects", PROJECTS, 30)]);
    settle().await;

    let users = dash.metric("users").unwrap();
    assert_eq!(users.value, Some(json!(3)));
    assert_eq!(users.error, None);
    assert!(!users.loading);

    let projects = dash.metric("projects").unwrap();
    assert_eq!(projects.value, None);
    assert!(projects.error.unwrap().contains("connection refused"));
    assert!(!projects.loading);

    assert!(dash.has_errors());
    assert!(!dash.is_loading());
}

#[tokio::test(start_paused = true)]
async fn failed_poll_keeps_last_good_value() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_json(USERS, json!({"count": 5}));
    let dash = start(&gw, vec![poll("users", USERS, 30)]);
    settle().await;
    assert_eq!(dash.metric("users").unwrap().value, Some(json!(5)));

    gw.set_status(USERS, 500);
    dash.refresh("users").await.unwrap();
    let st = dash.metric("users").unwrap();
    assert_eq!(st.value, Some(json!(5)));
    assert!(st.error.unwrap().contains("500"));

    // malformed payload is treated the same way
    gw.set_json(USERS, json!({"total": 9}));
    dash.refresh("users").await.unwrap();
    let st = dash.metric("users").unwrap();
    assert_eq!(st.value, Some(json!(5)));
    assert!(st.error.unwrap().contains("count"));

    // recovery clears the error; bare numbers are accepted too
    gw.set_json(USERS, json!(6));
    dash.refresh("users").await.unwrap();
    let st = dash.metric("users").unwrap();
    assert_eq!(st.value, Some(json!(6)));
    assert_eq!(st.error, None);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_does_not_reset_the_timer() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_json(USERS, json!({"count": 1}));
    let dash = start(&gw, vec![poll("users", USERS, 30)]);
    settle().await;
    assert_eq!(gw.calls(USERS), 1, "first fetch is immediate");

    tokio::time::advance(Duration::from_secs(5)).await;
    dash.refresh("users").await.unwrap();
    assert_eq!(gw.calls(USERS), 2);

    tokio::time::advance(Duration::from_millis(24_999)).await;
    settle().await;
    assert_eq!(gw.calls(USERS), 2);

    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(gw.calls(USERS), 3, "scheduled tick still at t=30s");

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(gw.calls(USERS), 4);
}

#[tokio::test(start_paused = true)]
async fn failures_do_not_slow_down_the_schedule() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_status(USERS, 503);
    gw.set_json(PROJECTS, json!({"count": 2}));
    let dash = start(&gw, vec![poll("users", USERS, 10), poll("projects", PROJECTS, 20)]);
    settle().await;

    for _ in 0..6 {
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
    }
    // fixed interval retry, no backoff
    assert_eq!(gw.calls(USERS), 7);
    assert_eq!(gw.calls(PROJECTS), 4);
    assert_eq!(dash.metric("projects").unwrap().value, Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn loading_stays_set_while_an_overlapping_refresh_is_out() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_json(USERS, json!({"count": 1}));
    gw.set_delay(USERS, Duration::from_secs(10));
    let dash = Arc::new(start(&gw, vec![poll("users", USERS, 30)]));
    settle().await;
    assert!(dash.is_loading(), "scheduled fetch out since t=0");

    tokio::time::advance(Duration::from_secs(5)).await;
    let manual = {
        let dash = dash.clone();
        tokio::spawn(async move { dash.refresh("users").await })
    };
    settle().await;

    // t=10: the scheduled fetch settled, the manual one (until t=15) has not
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    let st = dash.metric("users").unwrap();
    assert_eq!(st.value, Some(json!(1)));
    assert!(st.loading);
    assert!(!manual.is_finished());

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(manual.await.unwrap(), Ok(()));
    assert!(!dash.metric("users").unwrap().loading);
    assert!(!dash.is_loading());
}

#[tokio::test(start_paused = true)]
async fn cancelled_refresh_does_not_leave_loading_stuck() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_json(USERS, json!({"count": 1}));
    let dash = start(&gw, vec![poll("users", USERS, 30)]);
    settle().await;

    gw.set_delay(USERS, Duration::from_secs(10));
    let timed_out = tokio::time::timeout(Duration::from_secs(1), dash.refresh("users")).await;
    assert!(timed_out.is_err());
    assert!(!dash.metric("users").unwrap().loading);
}
