// src/dashboard.rs
//! # Dashboard (aggregator)
//! Owns the metric map and the health records, starts one driver per
//! registered source, and exposes snapshots plus manual refresh.
//!
//! Nothing in here ever fails because a source failed: every sub-operation
//! settles into state, and the public methods resolve once all have settled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::context::{DashboardContext, TaskArena};
use crate::feed::{ActivityFeed, ActivityFeedConsumer, FeedEndpoints, FeedHandle};
use crate::health::{HealthProber, HealthService, OverallHealth, ServiceHealthRecord};
use crate::poll::PollDriver;
use crate::registry::{Delivery, SourceDriver, SourceRegistry};
use crate::state::{MetricBoard, MetricState};
use crate::stream::StreamDriver;
use crate::telemetry::ensure_metrics_described;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    UnknownSource(String),
    /// Streams push on their own; they cannot be pulled manually.
    StreamSource(String),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::UnknownSource(name) => write!(f, "unknown metric source `{name}`"),
            RefreshError::StreamSource(name) => {
                write!(f, "metric source `{name}` is stream-driven and cannot be refreshed")
            }
        }
    }
}

impl std::error::Error for RefreshError {}

/// Everything one dashboard instance watches.
#[derive(Debug, Clone, Default)]
pub struct DashboardSetup {
    pub sources: SourceRegistry,
    pub services: Vec<HealthService>,
    pub feed: Option<FeedEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub metrics: BTreeMap<String, MetricState>,
    pub overall_health: OverallHealth,
    pub services: Vec<ServiceHealthRecord>,
    pub is_loading: bool,
    pub has_errors: bool,
}

pub struct Dashboard {
    ctx: DashboardContext,
    sources: SourceRegistry,
    board: MetricBoard,
    pollers: BTreeMap<String, Arc<PollDriver>>,
    health: Arc<HealthProber>,
    feed: Option<FeedHandle>,
    tasks: TaskArena,
}

impl Dashboard {
    /// Wire up and start every source, the health prober and (optionally) the
    /// activity feed. Must be called from within a Tokio runtime.
    pub fn start(ctx: DashboardContext, setup: DashboardSetup) -> Self {
        ensure_metrics_described();

        let DashboardSetup {
            sources,
            services,
            feed,
        } = setup;
        let tasks = TaskArena::new();
        let mut board = MetricBoard::new();
        let mut pollers = BTreeMap::new();

        for source in sources.iter() {
            let slot = board.insert(&source.name, ctx.lifecycle.clone());
            let driver: Arc<dyn SourceDriver> = match source.delivery {
                Delivery::Poll { interval } => {
                    let poller = Arc::new(PollDriver::new(
                        source.clone(),
                        interval,
                        slot,
                        ctx.gateway.clone(),
                    ));
                    pollers.insert(source.name.clone(), poller.clone());
                    poller as Arc<dyn SourceDriver>
                }
                Delivery::Stream => {
                    Arc::new(StreamDriver::new(source.clone(), slot, &ctx)) as Arc<dyn SourceDriver>
                }
            };
            tasks.spawn(format!("source:{}", source.name), async move {
                driver.drive().await
            });
        }

        let health = Arc::new(HealthProber::new(&ctx, services));
        let prober = health.clone();
        let interval = ctx.timings.health_interval;
        tasks.spawn("health", async move { prober.run(interval).await });

        let feed = feed.map(|endpoints| ActivityFeedConsumer::spawn(&ctx, endpoints));

        tracing::info!(
            target: "dashboard",
            sources = sources.len(),
            polled = pollers.len(),
            services = health.services().len(),
            feed = feed.is_some(),
            "dashboard started"
        );

        Self {
            ctx,
            sources,
            board,
            pollers,
            health,
            feed,
            tasks,
        }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            metrics: self.board.snapshot(),
            overall_health: self.health.overall(),
            services: self.health.records(),
            is_loading: self.is_loading(),
            has_errors: self.has_errors(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<MetricState> {
        self.board.get(name).map(|slot| slot.snapshot())
    }

    pub fn overall_health(&self) -> OverallHealth {
        self.health.overall()
    }

    pub fn health_records(&self) -> Vec<ServiceHealthRecord> {
        self.health.records()
    }

    pub fn feed(&self) -> Option<ActivityFeed> {
        self.feed.as_ref().map(|f| f.snapshot())
    }

    pub fn is_loading(&self) -> bool {
        self.board.is_loading()
    }

    pub fn has_errors(&self) -> bool {
        self.board.has_errors()
    }

    /// Manual re-fetch of one poll-mode source. The schedule is not reset.
    pub async fn refresh(&self, name: &str) -> Result<(), RefreshError> {
        match self.pollers.get(name) {
            Some(poller) => {
                poller.fetch_once().await;
                Ok(())
            }
            None if self.sources.get(name).is_some() => {
                Err(RefreshError::StreamSource(name.to_string()))
            }
            None => Err(RefreshError::UnknownSource(name.to_string())),
        }
    }

    /// Re-fetch every poll-mode source and re-probe health, all concurrently.
    pub async fn refresh_all(&self) {
        let polls = join_all(self.pollers.values().map(|p| p.fetch_once()));
        let probes = self.health.probe_all();
        let (_, overall) = futures::join!(polls, probes);
        tracing::debug!(target: "dashboard", overall = ?overall, "refresh all complete");
    }

    /// Manual catch-up of the activity feed, if one is configured.
    pub async fn refresh_feed(&self) {
        if let Some(feed) = &self.feed {
            feed.refresh().await;
        }
    }

    /// Stop every timer and close every connection. Idempotent.
    pub fn shutdown(&self) {
        let first = self.ctx.lifecycle.close();
        let aborted = self.tasks.abort_all();
        if let Some(feed) = &self.feed {
            feed.shutdown();
        }
        if first {
            tracing::info!(target: "dashboard", tasks = aborted, "dashboard shut down");
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
