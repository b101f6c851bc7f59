//! Live Dashboard: binary entrypoint
//! Loads configuration, wires the HTTP gateway and stream connector, starts the
//! dashboard and logs a JSON snapshot on a fixed cadence until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use live_dashboard::config::DashboardConfig;
use live_dashboard::gateway::{HttpGateway, RefreshingToken, StaticToken, TokenSource};
use live_dashboard::sse::HttpStreamConnector;
use live_dashboard::telemetry::default_log_filter;
use live_dashboard::{Dashboard, DashboardContext, DashboardSetup};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default; `DASHBOARD_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()));

    let json = std::env::var("DASHBOARD_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

/// Bearer credentials from the environment. Issuing tokens is someone else's job.
fn token_source_from_env() -> Option<Arc<dyn TokenSource>> {
    let access = std::env::var("DASHBOARD_ACCESS_TOKEN").ok();
    let refresh_url = std::env::var("DASHBOARD_REFRESH_URL").ok();
    let refresh_token = std::env::var("DASHBOARD_REFRESH_TOKEN").ok();
    match (refresh_url, refresh_token, access) {
        (Some(url), Some(rt), initial) => {
            Some(Arc::new(RefreshingToken::new(url, rt, initial)) as Arc<dyn TokenSource>)
        }
        (_, _, Some(token)) => Some(Arc::new(StaticToken(token)) as Arc<dyn TokenSource>),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = DashboardConfig::load_default().context("loading dashboard config")?;
    let timings = cfg.timings();

    let mut gateway = HttpGateway::new(reqwest::Client::new()).with_timeout(timings.probe_timeout);
    let mut connector = HttpStreamConnector::new(reqwest::Client::new());
    if let Some(tokens) = token_source_from_env() {
        gateway = gateway.with_tokens(tokens.clone());
        connector = connector.with_tokens(tokens);
    }

    let ctx = DashboardContext::new(Arc::new(gateway), Arc::new(connector)).with_timings(timings);
    let setup = DashboardSetup {
        sources: cfg.registry().context("building source registry")?,
        services: cfg.services(),
        feed: cfg.feed_endpoints(),
    };
    let dashboard = Dashboard::start(ctx, setup);

    let report_secs: u64 = std::env::var("DASHBOARD_REPORT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(15);
    let mut ticker = tokio::time::interval(Duration::from_secs(report_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = dashboard.snapshot();
                match serde_json::to_string(&snap) {
                    Ok(s) => tracing::info!(target: "live_dashboard", snapshot = %s, "dashboard snapshot"),
                    Err(e) => tracing::warn!("snapshot serialization failed: {e:#}"),
                }
                if let Some(feed) = dashboard.feed() {
                    tracing::info!(
                        target: "live_dashboard",
                        events = feed.events().len(),
                        connected = feed.connected(),
                        phase = ?feed.phase(),
                        "activity feed"
                    );
                }
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!("ctrl-c handler failed: {e:#}");
                }
                break;
            }
        }
    }

    dashboard.shutdown();
    Ok(())
}
