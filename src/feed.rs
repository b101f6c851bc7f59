// src/feed.rs
//! # Activity Feed
//! Bounded, duplicate-free, newest-first list of recent activity.
//!
//! Bootstraps from a one-shot snapshot, then follows a live stream that resumes
//! from the last seen event id. Delivery order on the stream is not trusted:
//! every insert is followed by a full stable re-sort on the timestamp.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::counter;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::context::{DashboardContext, Lifecycle};
use crate::gateway::{Access, Gateway};
use crate::sse::{SseEvent, StreamConnector};
use crate::telemetry::{FEED_DEDUP_TOTAL, FEED_EVENTS_TOTAL};

pub const DEFAULT_CAPACITY: usize = 50;
pub const RECONNECTING: &str = "Connection lost. Reconnecting...";
pub const ACTIVITY: &str = "activity";
pub const HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Opaque cursor / dedup key. Numeric ids are kept as their decimal text.
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

fn opaque_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unsupported event id: {other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedPhase {
    Bootstrapping,
    Connecting,
    Live,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityFeed {
    events: Vec<ActivityEvent>,
    connected: bool,
    last_cursor: Option<String>,
    phase: FeedPhase,
    error: Option<String>,
    #[serde(skip)]
    capacity: usize,
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ActivityFeed {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            connected: false,
            last_cursor: None,
            phase: FeedPhase::Bootstrapping,
            error: None,
            capacity: capacity.clamp(1, DEFAULT_CAPACITY),
        }
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn last_cursor(&self) -> Option<&str> {
        self.last_cursor.as_deref()
    }

    pub fn phase(&self) -> FeedPhase {
        self.phase
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sort_and_bound(&mut self) {
        // stable: equal timestamps keep their relative order
        self.events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.events.truncate(self.capacity);
    }

    /// Replace the list with a fresh snapshot. Duplicate ids inside the snapshot
    /// keep only their newest copy. An empty snapshot keeps the previous cursor.
    pub fn replace_snapshot(&mut self, events: Vec<ActivityEvent>) {
        self.events = events;
        self.events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut seen = std::collections::HashSet::new();
        self.events.retain(|e| seen.insert(e.id.clone()));
        self.events.truncate(self.capacity);
        if let Some(newest) = self.events.first() {
            self.last_cursor = Some(newest.id.clone());
        }
    }

    /// Insert one live event. Returns `false` if its id is already present.
    pub fn insert(&mut self, event: ActivityEvent) -> bool {
        if self.events.iter().any(|e| e.id == event.id) {
            return false;
        }
        let id = event.id.clone();
        self.events.insert(0, event);
        self.sort_and_bound();
        self.last_cursor = Some(id);
        true
    }
}

/// Where the feed lives on the backend. Both endpoints are public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEndpoints {
    pub snapshot_url: String,
    pub stream_url: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl FeedEndpoints {
    pub fn new(snapshot_url: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            snapshot_url: snapshot_url.into(),
            stream_url: stream_url.into(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn snapshot_request(&self) -> String {
        with_query(&self.snapshot_url, "limit", &self.capacity.to_string())
    }

    /// Stream URL, carrying `lastEventId` as a resume hint when a cursor is known.
    pub fn stream_request(&self, cursor: Option<&str>) -> String {
        match cursor {
            Some(c) => with_query(&self.stream_url, "lastEventId", c),
            None => self.stream_url.clone(),
        }
    }
}

fn with_query(base: &str, key: &str, value: &str) -> String {
    match reqwest::Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(key, value);
            url.to_string()
        }
        Err(_) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{base}{sep}{key}={value}")
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    #[serde(default)]
    activities: Vec<Value>,
}

pub struct ActivityFeedConsumer {
    endpoints: FeedEndpoints,
    state: Mutex<ActivityFeed>,
    gateway: Arc<dyn Gateway>,
    connector: Arc<dyn StreamConnector>,
    reconnect_delay: Duration,
    lifecycle: Lifecycle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityFeedConsumer {
    /// Build without starting. The feed has its own lifecycle, independent of the
    /// dashboard metrics.
    pub fn new(ctx: &DashboardContext, mut endpoints: FeedEndpoints) -> Self {
        endpoints.capacity = endpoints.capacity.clamp(1, DEFAULT_CAPACITY);
        let capacity = endpoints.capacity;
        Self {
            endpoints,
            state: Mutex::new(ActivityFeed::with_capacity(capacity)),
            gateway: ctx.gateway.clone(),
            connector: ctx.connector.clone(),
            reconnect_delay: ctx.timings.reconnect_delay,
            lifecycle: Lifecycle::new(),
            task: Mutex::new(None),
        }
    }

    /// Build and start the bootstrap-then-follow loop on a background task.
    /// Dropping the returned handle stops the feed.
    pub fn spawn(ctx: &DashboardContext, endpoints: FeedEndpoints) -> FeedHandle {
        let consumer = Arc::new(Self::new(ctx, endpoints));
        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        *consumer.task.lock().expect("feed task mutex poisoned") = Some(handle);
        FeedHandle { consumer }
    }

    pub fn snapshot(&self) -> ActivityFeed {
        self.state.lock().expect("feed state mutex poisoned").clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ActivityFeed) -> R) -> Option<R> {
        let mut st = self.state.lock().expect("feed state mutex poisoned");
        if self.lifecycle.is_closed() {
            return None;
        }
        Some(f(&mut st))
    }

    /// Manual catch-up: re-run the snapshot fetch. The live connection is left alone.
    pub async fn refresh(&self) {
        self.load_snapshot().await;
    }

    async fn load_snapshot(&self) {
        match self.fetch_snapshot().await {
            Ok(events) => {
                let n = events.len();
                self.update(|st| {
                    st.replace_snapshot(events);
                    st.error = None;
                });
                tracing::info!(target: "feed", events = n, "activity snapshot loaded");
            }
            Err(e) => {
                tracing::warn!(target: "feed", error = %format!("{e:#}"), "activity snapshot failed");
                self.update(|st| st.error = Some(format!("failed to load activity history: {e:#}")));
            }
        }
    }

    async fn fetch_snapshot(&self) -> Result<Vec<ActivityEvent>> {
        let url = self.endpoints.snapshot_request();
        let body: SnapshotBody = self
            .gateway
            .get(&url, Access::Public)
            .await
            .context("fetch activity snapshot")?
            .json()
            .context("decode activity snapshot")?;

        let mut events = Vec::with_capacity(body.activities.len());
        for raw in body.activities {
            match serde_json::from_value::<ActivityEvent>(raw) {
                Ok(ev) => events.push(ev),
                Err(e) => tracing::debug!(target: "feed", error = %e, "skipping malformed snapshot event"),
            }
        }
        Ok(events)
    }

    async fn run_connection(&self) -> Result<()> {
        let cursor = self
            .update(|st| {
                st.phase = FeedPhase::Connecting;
                st.last_cursor.clone()
            })
            .flatten();
        let url = self.endpoints.stream_request(cursor.as_deref());
        let mut events = self
            .connector
            .connect(&url, Access::Public)
            .await
            .context("connect activity stream")?;
        self.update(|st| {
            st.connected = true;
            st.phase = FeedPhase::Live;
            st.error = None;
        });
        tracing::info!(target: "feed", resume = ?cursor, "activity stream live");

        while let Some(item) = events.next().await {
            let ev = item.context("activity stream")?;
            self.handle_event(&ev);
        }
        Ok(())
    }

    pub fn handle_event(&self, ev: &SseEvent) {
        match ev.event.as_str() {
            ACTIVITY => match serde_json::from_str::<ActivityEvent>(ev.data.trim()) {
                Ok(activity) => {
                    let id = activity.id.clone();
                    match self.update(|st| st.insert(activity)) {
                        Some(true) => counter!(FEED_EVENTS_TOTAL).increment(1),
                        Some(false) => {
                            tracing::trace!(target: "feed", id = %id, "duplicate activity dropped");
                            counter!(FEED_DEDUP_TOTAL).increment(1);
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "feed", error = %e, "malformed activity event");
                    self.update(|st| st.error = Some(format!("malformed activity event: {e}")));
                }
            },
            HEARTBEAT => tracing::trace!(target: "feed", "heartbeat"),
            other => tracing::debug!(target: "feed", event = other, "ignoring event"),
        }
    }

    /// Bootstrapping → Connecting → Live, and back to Connecting after a fixed
    /// delay whenever the transport fails.
    pub async fn run(&self) {
        self.update(|st| st.phase = FeedPhase::Bootstrapping);
        self.load_snapshot().await;
        loop {
            match self.run_connection().await {
                Ok(()) => tracing::warn!(target: "feed", "activity stream closed by server"),
                Err(e) => tracing::warn!(target: "feed", error = %format!("{e:#}"), "activity stream error"),
            }
            self.update(|st| {
                st.connected = false;
                st.phase = FeedPhase::Reconnecting;
                st.error = Some(RECONNECTING.to_string());
            });
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Idempotent. After this no state transition happens anymore.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock().expect("feed state mutex poisoned");
            if self.lifecycle.close() {
                st.connected = false;
                st.phase = FeedPhase::Closed;
            }
        }
        if let Some(handle) = self.task.lock().expect("feed task mutex poisoned").take() {
            handle.abort();
            tracing::debug!(target: "feed", "activity feed stopped");
        }
    }
}

/// Owner of a running feed. The background task keeps its own reference to the
/// consumer, so the task is stopped here rather than by the consumer's drop.
pub struct FeedHandle {
    consumer: Arc<ActivityFeedConsumer>,
}

impl FeedHandle {
    pub fn consumer(&self) -> &Arc<ActivityFeedConsumer> {
        &self.consumer
    }
}

impl Deref for FeedHandle {
    type Target = ActivityFeedConsumer;

    fn deref(&self) -> &Self::Target {
        &self.consumer
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.consumer.shutdown();
    }
}
