// src/registry.rs
//! Source registry: the static table of live metrics, one entry per logical
//! metric name, fixed at startup.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::Access;

/// Raw payload → display value. Errors are recorded by the caller, never propagated.
pub type Transform = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Poll { interval: Duration },
    Stream,
}

#[derive(Clone)]
pub struct MetricSource {
    pub name: String,
    pub endpoint: String,
    pub delivery: Delivery,
    pub access: Access,
    transform: Transform,
}

impl fmt::Debug for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSource")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("delivery", &self.delivery)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl MetricSource {
    pub fn poll(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        interval: Duration,
        transform: Transform,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            delivery: Delivery::Poll { interval },
            access: Access::Authenticated,
            transform,
        }
    }

    pub fn stream(name: impl Into<String>, endpoint: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            delivery: Delivery::Stream,
            access: Access::Authenticated,
            transform,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn apply(&self, raw: &Value) -> Result<Value> {
        (self.transform)(raw)
    }

    pub fn is_poll(&self) -> bool {
        matches!(self.delivery, Delivery::Poll { .. })
    }
}

/// Common capability of the per-variant drivers (poll scheduler, stream consumer).
#[async_trait]
pub trait SourceDriver: Send + Sync {
    fn source(&self) -> &MetricSource;

    /// Runs until the owning task is aborted.
    async fn drive(&self);
}

/// Stock transforms for the wire shapes the backend uses.
pub mod transforms {
    use super::*;

    /// `{ <field>: n }` or a bare number.
    pub fn count(field: &str) -> Transform {
        let field = field.to_string();
        Arc::new(move |raw: &Value| match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::Object(map) => match map.get(&field) {
                Some(v @ Value::Number(_)) => Ok(v.clone()),
                Some(other) => bail!("field `{field}` is not a number: {other}"),
                None => bail!("missing field `{field}`"),
            },
            other => bail!("expected a number or an object, got {other}"),
        })
    }

    /// `{ <field>: [...] }`.
    pub fn series(field: &str) -> Transform {
        let field = field.to_string();
        Arc::new(move |raw: &Value| match raw.get(&field) {
            Some(v @ Value::Array(_)) => Ok(v.clone()),
            Some(other) => bail!("field `{field}` is not an array: {other}"),
            None => bail!("missing field `{field}`"),
        })
    }

    pub fn identity() -> Transform {
        Arc::new(|raw: &Value| Ok(raw.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<MetricSource>,
}

impl SourceRegistry {
    /// Validates the table: unique non-empty names, non-zero poll intervals.
    pub fn new(sources: Vec<MetricSource>) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &sources {
            if s.name.trim().is_empty() {
                bail!("metric source with empty name ({})", s.endpoint);
            }
            if !seen.insert(s.name.as_str()) {
                bail!("duplicate metric source `{}`", s.name);
            }
            if let Delivery::Poll { interval } = s.delivery {
                if interval.is_zero() {
                    bail!("metric source `{}` has a zero poll interval", s.name);
                }
            }
        }
        Ok(Self { sources })
    }

    /// The stock dashboard: four polled counters and two visit streams.
    pub fn default_for(base_url: &str, poll_interval: Duration) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = |path: &str| format!("{base}{path}");
        let sources = vec![
            MetricSource::poll("users", url("/api/users/count"), poll_interval, transforms::count("count")),
            MetricSource::poll("projects", url("/api/projects/count"), poll_interval, transforms::count("count")),
            MetricSource::poll("blog_posts", url("/api/blogs/count"), poll_interval, transforms::count("count")),
            MetricSource::poll("messages", url("/api/messages/count"), poll_interval, transforms::count("count")),
            MetricSource::stream("weekly_visits", url("/api/visits/weekly/stream"), transforms::count("count")),
            MetricSource::stream("all_visits", url("/api/visits/stream"), transforms::series("visits")),
        ];
        Self { sources }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSource> {
        self.sources.iter()
    }

    pub fn get(&self, name: &str) -> Option<&MetricSource> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
