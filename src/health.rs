// src/health.rs
//! # Health Prober
//! Probes every registered service concurrently, records Operational/Down per
//! service, and derives one tri-state system health value.
//!
//! Each probe is isolated: its own timeout, its own record. The fan-out is
//! joined, so `probe_all` resolves only once every probe has settled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};

use crate::context::{DashboardContext, Lifecycle};
use crate::gateway::{Access, Gateway};
use crate::telemetry::{HEALTH_PROBE_FAILURES_TOTAL, OVERALL_HEALTH};

/// A monitored service as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthService {
    pub id: String,
    pub name: String,
    /// Free-form label ("api", "database", ...).
    #[serde(default)]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Operational,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Operational,
    /// At least one service is down ("degraded").
    Down,
    Unknown,
}

impl OverallHealth {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ServiceHealthRecord>,
    {
        let mut any = false;
        for r in records {
            any = true;
            if r.status == ServiceStatus::Down {
                return OverallHealth::Down;
            }
        }
        if any {
            OverallHealth::Operational
        } else {
            OverallHealth::Unknown
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            OverallHealth::Operational => 1.0,
            OverallHealth::Down => 0.0,
            OverallHealth::Unknown => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealthRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: ServiceStatus,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

pub struct HealthProber {
    services: Vec<HealthService>,
    records: Mutex<BTreeMap<String, ServiceHealthRecord>>,
    gateway: Arc<dyn Gateway>,
    timeout: Duration,
    lifecycle: Lifecycle,
}

impl HealthProber {
    pub fn new(ctx: &DashboardContext, services: Vec<HealthService>) -> Self {
        Self {
            services,
            records: Mutex::new(BTreeMap::new()),
            gateway: ctx.gateway.clone(),
            timeout: ctx.timings.probe_timeout,
            lifecycle: ctx.lifecycle.clone(),
        }
    }

    pub fn services(&self) -> &[HealthService] {
        &self.services
    }

    /// Records in declaration order; services never probed yet are absent.
    pub fn records(&self) -> Vec<ServiceHealthRecord> {
        let map = self.records.lock().expect("health records mutex poisoned");
        self.services
            .iter()
            .filter_map(|s| map.get(&s.id).cloned())
            .collect()
    }

    pub fn overall(&self) -> OverallHealth {
        let map = self.records.lock().expect("health records mutex poisoned");
        OverallHealth::from_records(map.values())
    }

    /// Probe every service in parallel and wait for all of them.
    pub async fn probe_all(&self) -> OverallHealth {
        join_all(self.services.iter().map(|svc| self.probe(svc))).await;
        let overall = self.overall();
        if !self.lifecycle.is_closed() {
            gauge!(OVERALL_HEALTH).set(overall.gauge_value());
            tracing::debug!(target: "health", overall = ?overall, "health probed");
        }
        overall
    }

    async fn probe(&self, svc: &HealthService) {
        let started = Instant::now();
        let outcome = time::timeout(self.timeout, self.gateway.get(&svc.url, Access::Public)).await;
        let (status, error) = match outcome {
            Ok(Ok(reply)) if reply.is_success() => (ServiceStatus::Operational, None),
            Ok(Ok(reply)) => (ServiceStatus::Down, Some(format!("HTTP {}", reply.status))),
            Ok(Err(e)) => (ServiceStatus::Down, Some(format!("{e:#}"))),
            Err(_) => (
                ServiceStatus::Down,
                Some(format!("no response within {} ms", self.timeout.as_millis())),
            ),
        };
        if status == ServiceStatus::Down {
            tracing::warn!(target: "health", service = %svc.id, error = ?error, "service down");
            counter!(HEALTH_PROBE_FAILURES_TOTAL, "service" => svc.id.clone()).increment(1);
        }

        let record = ServiceHealthRecord {
            id: svc.id.clone(),
            name: svc.name.clone(),
            kind: svc.kind.clone(),
            status,
            last_check: Utc::now(),
            error,
            latency_ms: started.elapsed().as_millis() as u64,
        };
        let mut map = self.records.lock().expect("health records mutex poisoned");
        if !self.lifecycle.is_closed() {
            map.insert(svc.id.clone(), record);
        }
    }

    /// Probe at start, then every `interval`, until the task is aborted.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.probe_all().await;
        }
    }
}
