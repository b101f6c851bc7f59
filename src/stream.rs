// src/stream.rs
//! Stream consumer: one persistent server-push connection per source.
//! The latest message replaces the value; a lost connection is retried after a
//! fixed delay, forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde_json::Value;

use crate::context::DashboardContext;
use crate::registry::{MetricSource, SourceDriver};
use crate::sse::{SseEvent, StreamConnector, MESSAGE};
use crate::state::MetricSlot;
use crate::telemetry::{STREAM_MESSAGES_TOTAL, STREAM_RECONNECTS_TOTAL};

pub const RECONNECTING: &str = "connection lost, reconnecting";
pub const HEARTBEAT: &str = "heartbeat";

pub struct StreamDriver {
    source: MetricSource,
    slot: Arc<MetricSlot>,
    connector: Arc<dyn StreamConnector>,
    reconnect_delay: Duration,
}

impl StreamDriver {
    pub fn new(source: MetricSource, slot: Arc<MetricSlot>, ctx: &DashboardContext) -> Self {
        Self {
            source,
            slot,
            connector: ctx.connector.clone(),
            reconnect_delay: ctx.timings.reconnect_delay,
        }
    }

    /// Runs one connection until the server closes it (`Ok`) or the transport fails.
    async fn run_connection(&self) -> Result<()> {
        self.slot.begin();
        let mut events = self
            .connector
            .connect(&self.source.endpoint, self.source.access)
            .await
            .with_context(|| format!("connect {}", self.source.name))?;
        self.slot.connected();
        tracing::info!(target: "stream", source = %self.source.name, "stream connected");

        while let Some(item) = events.next().await {
            let ev = item.with_context(|| format!("stream {}", self.source.name))?;
            self.handle_event(&ev);
        }
        Ok(())
    }

    /// Malformed payloads are recorded on the slot; the connection stays up.
    pub fn handle_event(&self, ev: &SseEvent) {
        let name = self.source.name.as_str();
        match ev.event.as_str() {
            MESSAGE => match self.decode(&ev.data) {
                Ok(value) => {
                    counter!(STREAM_MESSAGES_TOTAL, "source" => name.to_string()).increment(1);
                    self.slot.succeed(value);
                }
                Err(e) => {
                    tracing::warn!(target: "stream", source = name, error = %format!("{e:#}"), "bad stream message");
                    self.slot.fail(format!("{e:#}"));
                }
            },
            HEARTBEAT => tracing::trace!(target: "stream", source = name, "heartbeat"),
            other => tracing::debug!(target: "stream", source = name, event = other, "ignoring event"),
        }
    }

    fn decode(&self, data: &str) -> Result<Value> {
        let raw: Value = serde_json::from_str(data.trim()).context("parse stream message")?;
        self.source.apply(&raw).context("transform stream message")
    }
}

#[async_trait]
impl SourceDriver for StreamDriver {
    fn source(&self) -> &MetricSource {
        &self.source
    }

    async fn drive(&self) {
        let name = self.source.name.as_str();
        loop {
            match self.run_connection().await {
                Ok(()) => tracing::warn!(target: "stream", source = name, "stream closed by server"),
                Err(e) => tracing::warn!(target: "stream", source = name, error = %format!("{e:#}"), "stream error"),
            }
            // dropping the stream above closed the connection
            self.slot.disconnected(RECONNECTING);
            counter!(STREAM_RECONNECTS_TOTAL, "source" => name.to_string()).increment(1);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}
