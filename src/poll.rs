// src/poll.rs
//! Poll scheduler: fetch once immediately, then on a fixed interval, forever.
//! Failures are recorded on the slot and never touch the timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tokio::time::{self, MissedTickBehavior};

use crate::gateway::Gateway;
use crate::registry::{MetricSource, SourceDriver};
use crate::state::MetricSlot;
use crate::telemetry::{POLL_ERRORS_TOTAL, POLL_TOTAL};

/// Settles the slot when a fetch future is dropped mid-flight (a cancelled
/// manual refresh), so `loading` cannot stick.
struct Pending<'a> {
    slot: &'a MetricSlot,
    armed: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.abandon();
        }
    }
}

pub struct PollDriver {
    source: MetricSource,
    interval: Duration,
    slot: Arc<MetricSlot>,
    gateway: Arc<dyn Gateway>,
}

impl PollDriver {
    pub fn new(
        source: MetricSource,
        interval: Duration,
        slot: Arc<MetricSlot>,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self {
            source,
            interval,
            slot,
            gateway,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One fetch + transform + write. Used by the schedule and by manual refresh.
    pub async fn fetch_once(&self) {
        let name = self.source.name.as_str();
        if !self.slot.begin() {
            return;
        }
        counter!(POLL_TOTAL, "source" => name.to_string()).increment(1);

        let mut pending = Pending {
            slot: &self.slot,
            armed: true,
        };
        let outcome = self.fetch().await;
        pending.armed = false;

        match outcome {
            Ok(value) => {
                tracing::debug!(target: "poll", source = name, "poll ok");
                self.slot.succeed(value);
            }
            Err(e) => {
                tracing::warn!(target: "poll", source = name, error = %format!("{e:#}"), "poll failed");
                counter!(POLL_ERRORS_TOTAL, "source" => name.to_string()).increment(1);
                self.slot.fail(format!("{e:#}"));
            }
        }
    }

    async fn fetch(&self) -> Result<Value> {
        let raw = self
            .gateway
            .get_json(&self.source.endpoint, self.source.access)
            .await
            .with_context(|| format!("fetch {}", self.source.name))?;
        self.source
            .apply(&raw)
            .with_context(|| format!("transform {}", self.source.name))
    }
}

#[async_trait]
impl SourceDriver for PollDriver {
    fn source(&self) -> &MetricSource {
        &self.source
    }

    async fn drive(&self) {
        // First tick completes immediately. A tick that comes due while the
        // previous fetch is still outstanding is skipped, not queued.
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.fetch_once().await;
        }
    }
}
