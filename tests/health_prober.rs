// tests/health_prober.rs
use std::sync::Arc;
use std::time::Duration;

use live_dashboard::testing::{ScriptedConnector, ScriptedGateway};
use live_dashboard::{
    Dashboard, DashboardContext, DashboardSetup, HealthService, OverallHealth, ServiceStatus,
    Timings,
};

const API: &str = "http://api.test/health";
const ML: &str = "http://ml.test/health";

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn service(id: &str, url: &str) -> HealthService {
    HealthService {
        id: id.to_string(),
        name: format!("{id} service"),
        kind: "api".to_string(),
        url: url.to_string(),
    }
}

fn start(gw: &Arc<ScriptedGateway>, timings: Timings) -> Dashboard {
    let ctx = DashboardContext::new(gw.clone(), Arc::new(ScriptedConnector::new())).with_timings(timings);
    Dashboard::start(
        ctx,
        DashboardSetup {
            services: vec![service("api", API), service("ml", ML)],
            ..Default::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn aggregate_follows_every_record() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_status(API, 200);
    gw.set_status(ML, 200);
    let dash = start(&gw, Timings::default());
    assert_eq!(dash.overall_health(), OverallHealth::Unknown, "nothing probed yet");

    settle().await;
    assert_eq!(dash.overall_health(), OverallHealth::Operational);

    gw.set_status(ML, 500);
    dash.refresh_all().await;
    assert_eq!(dash.overall_health(), OverallHealth::Down);
    let records = dash.health_records();
    assert_eq!(records[0].status, ServiceStatus::Operational);
    assert_eq!(records[1].status, ServiceStatus::Down);
    assert_eq!(records[1].error.as_deref(), Some("HTTP 500"));

    gw.set_status(ML, 204);
    dash.refresh_all().await;
    assert_eq!(dash.overall_health(), OverallHealth::Operational);
    assert!(dash.health_records().iter().all(|r| r.error.is_none()));
}

#[tokio::test(start_paused = true)]
async fn slow_probe_times_out_without_holding_back_siblings() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_status(API, 200);
    gw.set_status(ML, 200);
    gw.set_delay(ML, Duration::from_secs(30));
    let timings = Timings {
        probe_timeout: Duration::from_secs(2),
        ..Timings::default()
    };
    let dash = start(&gw, timings);

    dash.refresh_all().await;
    let records = dash.health_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, ServiceStatus::Operational);
    assert_eq!(records[1].status, ServiceStatus::Down);
    assert!(records[1].error.as_deref().unwrap().contains("2000 ms"));
    assert_eq!(dash.overall_health(), OverallHealth::Down);
}

#[tokio::test(start_paused = true)]
async fn network_errors_mark_only_that_service_down() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_status(API, 200);
    gw.set_error(ML, "dns lookup failed");
    let dash = start(&gw, Timings::default());
    settle().await;

    let records = dash.health_records();
    assert_eq!(records[0].status, ServiceStatus::Operational);
    assert!(records[1].error.as_deref().unwrap().contains("dns lookup failed"));
    // metrics are separate from health
    assert!(!dash.has_errors());
}

#[tokio::test(start_paused = true)]
async fn probes_run_on_their_own_interval() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_status(API, 200);
    gw.set_status(ML, 200);
    let _dash = start(&gw, Timings::default());
    settle().await;
    assert_eq!(gw.calls(API), 1);

    tokio::time::advance(Duration::from_secs(119)).await;
    settle().await;
    assert_eq!(gw.calls(API), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(gw.calls(API), 2);
    assert_eq!(gw.calls(ML), 2);
}
