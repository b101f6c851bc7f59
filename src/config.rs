// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::Timings;
use crate::feed::{FeedEndpoints, DEFAULT_CAPACITY};
use crate::gateway::Access;
use crate::health::HealthService;
use crate::registry::{transforms, MetricSource, SourceRegistry};

pub const ENV_CONFIG_PATH: &str = "DASHBOARD_CONFIG_PATH";

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_health_interval_secs() -> u64 {
    120
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_feed_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_field() -> String {
    "count".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Explicit per-probe bound instead of whatever the transport defaults to.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Health endpoints; relative URLs are resolved against `base_url`.
    #[serde(default)]
    pub services: Vec<HealthService>,
    #[serde(default)]
    pub activity: Option<ActivityPaths>,
    /// Replaces the stock source table when non-empty.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            health_interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            feed_capacity: default_feed_capacity(),
            services: Vec::new(),
            activity: None,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPaths {
    pub snapshot_path: String,
    pub stream_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Poll,
    Stream,
}

/// How the raw payload becomes a display value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueShape {
    #[default]
    Count,
    Series,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub path: String,
    pub mode: SourceMode,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default)]
    pub shape: ValueShape,
    #[serde(default)]
    pub access: Access,
}

impl DashboardConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading dashboard config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        parse_config(&content, ext.as_str()).map(Self::sanitize)
    }

    /// Load using env var + fallbacks:
    /// 1) $DASHBOARD_CONFIG_PATH
    /// 2) config/dashboard.toml
    /// 3) config/dashboard.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("DASHBOARD_CONFIG_PATH points to non-existent path"));
            }
        }
        let toml_p = PathBuf::from("config/dashboard.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from("config/dashboard.json");
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Ok(Self::default())
    }

    /// Zero intervals and capacities fall back to their defaults.
    fn sanitize(mut self) -> Self {
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = default_poll_interval_secs();
        }
        if self.reconnect_delay_secs == 0 {
            self.reconnect_delay_secs = default_reconnect_delay_secs();
        }
        if self.health_interval_secs == 0 {
            self.health_interval_secs = default_health_interval_secs();
        }
        if self.probe_timeout_secs == 0 {
            self.probe_timeout_secs = default_probe_timeout_secs();
        }
        // the feed never holds more than DEFAULT_CAPACITY events
        if self.feed_capacity == 0 || self.feed_capacity > DEFAULT_CAPACITY {
            self.feed_capacity = default_feed_capacity();
        }
        for s in &mut self.sources {
            if s.interval_secs == Some(0) {
                s.interval_secs = None;
            }
        }
        self
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn timings(&self) -> Timings {
        Timings {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            health_interval: Duration::from_secs(self.health_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    pub fn registry(&self) -> Result<SourceRegistry> {
        let default_interval = Duration::from_secs(self.poll_interval_secs);
        if self.sources.is_empty() {
            return Ok(SourceRegistry::default_for(&self.base_url, default_interval));
        }
        let mut out = Vec::with_capacity(self.sources.len());
        for entry in &self.sources {
            let transform = match entry.shape {
                ValueShape::Count => transforms::count(&entry.field),
                ValueShape::Series => transforms::series(&entry.field),
                ValueShape::Raw => transforms::identity(),
            };
            let endpoint = self.url(&entry.path);
            let source = match entry.mode {
                SourceMode::Poll => {
                    let interval = entry
                        .interval_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default_interval);
                    MetricSource::poll(&entry.name, endpoint, interval, transform)
                }
                SourceMode::Stream => {
                    if entry.interval_secs.is_some() {
                        bail!("stream source `{}` cannot have a poll interval", entry.name);
                    }
                    MetricSource::stream(&entry.name, endpoint, transform)
                }
            };
            out.push(source.with_access(entry.access));
        }
        SourceRegistry::new(out)
    }

    pub fn services(&self) -> Vec<HealthService> {
        self.services
            .iter()
            .map(|s| HealthService {
                url: self.url(&s.url),
                ..s.clone()
            })
            .collect()
    }

    pub fn feed_endpoints(&self) -> Option<FeedEndpoints> {
        self.activity.as_ref().map(|a| FeedEndpoints {
            snapshot_url: self.url(&a.snapshot_path),
            stream_url: self.url(&a.stream_path),
            capacity: self.feed_capacity,
        })
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<DashboardConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("parsing dashboard config JSON");
    }
    if hint_ext == "toml" {
        return toml::from_str(s).context("parsing dashboard config TOML");
    }
    // Unknown extension: JSON if it looks like an object, else TOML.
    if s.trim_start().starts_with('{') {
        serde_json::from_str(s).context("parsing dashboard config JSON")
    } else {
        toml::from_str(s).context("parsing dashboard config TOML")
    }
}
