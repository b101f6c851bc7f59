// src/telemetry.rs
//! Counter/gauge names used across the dashboard. Recorder installation is up
//! to the host process; without one, the `metrics` macros are no-ops.

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

pub const POLL_TOTAL: &str = "dashboard_poll_total";
pub const POLL_ERRORS_TOTAL: &str = "dashboard_poll_errors_total";
pub const STREAM_MESSAGES_TOTAL: &str = "dashboard_stream_messages_total";
pub const STREAM_RECONNECTS_TOTAL: &str = "dashboard_stream_reconnects_total";
pub const HEALTH_PROBE_FAILURES_TOTAL: &str = "dashboard_health_probe_failures_total";
pub const OVERALL_HEALTH: &str = "dashboard_overall_health";
pub const FEED_EVENTS_TOTAL: &str = "dashboard_feed_events_total";
pub const FEED_DEDUP_TOTAL: &str = "dashboard_feed_dedup_total";

/// `tracing` targets the components log under.
pub const LOG_TARGETS: [&str; 7] = [
    "live_dashboard",
    "dashboard",
    "poll",
    "stream",
    "health",
    "feed",
    "gateway",
];

/// `EnvFilter` directives used when `RUST_LOG` is unset: info for our own
/// targets, warn for everything else.
pub fn default_log_filter() -> String {
    let mut directives: Vec<String> = LOG_TARGETS.iter().map(|t| format!("{t}=info")).collect();
    directives.push("warn".to_string());
    directives.join(",")
}

/// One-time metrics registration (so series show up on a scrape).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(POLL_TOTAL, "Poll fetches issued, scheduled or manual.");
        describe_counter!(POLL_ERRORS_TOTAL, "Poll fetches that failed to fetch or transform.");
        describe_counter!(STREAM_MESSAGES_TOTAL, "Server-push messages applied to a metric.");
        describe_counter!(
            STREAM_RECONNECTS_TOTAL,
            "Stream connections lost and scheduled for reconnect."
        );
        describe_counter!(HEALTH_PROBE_FAILURES_TOTAL, "Health probes that reported Down.");
        describe_gauge!(
            OVERALL_HEALTH,
            "Aggregate service health: 1 operational, 0 down, -1 unknown."
        );
        describe_counter!(FEED_EVENTS_TOTAL, "Activity events accepted into the feed.");
        describe_counter!(FEED_DEDUP_TOTAL, "Activity events dropped as duplicates.");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{EnvFilter, Layer, Registry};

    struct CountEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for CountEvents {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_filter_lets_component_info_through() {
        let seen = Arc::new(AtomicUsize::new(0));
        let subscriber = Registry::default()
            .with(EnvFilter::new(default_log_filter()))
            .with(CountEvents(seen.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "dashboard", "dashboard started");
            tracing::info!(target: "stream", "stream connected");
            tracing::info!(target: "feed", "activity snapshot loaded");
            tracing::debug!(target: "poll", "poll ok");
            tracing::info!(target: "hyper", "chatty dependency");
            tracing::warn!(target: "hyper", "dependency warning");
        });

        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
