// src/state.rs
//! Per-source metric slots. Each slot has its own lock and exactly one writer
//! (the driver that owns the source); readers get cloned snapshots.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::Lifecycle;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricState {
    /// Last successfully transformed value. A failed attempt never clears it.
    pub value: Option<Value>,
    pub loading: bool,
    pub error: Option<String>,
    /// Stream sources only: connection currently open.
    pub connected: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SlotInner {
    state: MetricState,
    /// Fetches / connect attempts started but not yet settled.
    in_flight: usize,
}

impl SlotInner {
    fn settle(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.state.loading = self.in_flight > 0;
    }
}

#[derive(Debug)]
pub struct MetricSlot {
    name: String,
    inner: Mutex<SlotInner>,
    lifecycle: Lifecycle,
}

impl MetricSlot {
    pub fn new(name: impl Into<String>, lifecycle: Lifecycle) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(SlotInner::default()),
            lifecycle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> MetricState {
        self.inner.lock().expect("metric slot mutex poisoned").state.clone()
    }

    /// Apply `f` unless the dashboard has been torn down. Returns whether it ran.
    fn update(&self, f: impl FnOnce(&mut SlotInner)) -> bool {
        let mut inner = self.inner.lock().expect("metric slot mutex poisoned");
        if self.lifecycle.is_closed() {
            tracing::trace!(target: "dashboard", source = %self.name, "late update after teardown dropped");
            return false;
        }
        f(&mut inner);
        true
    }

    /// Marks one more fetch (or connect attempt) outstanding.
    pub fn begin(&self) -> bool {
        self.update(|inner| {
            inner.in_flight += 1;
            inner.state.loading = true;
        })
    }

    /// Settles one outstanding fetch with a value. `loading` stays set while
    /// an overlapping fetch is still out.
    pub fn succeed(&self, value: Value) -> bool {
        self.update(|inner| {
            inner.settle();
            inner.state.value = Some(value);
            inner.state.error = None;
            inner.state.updated_at = Some(Utc::now());
        })
    }

    pub fn fail(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(|inner| {
            inner.settle();
            inner.state.error = Some(error);
        })
    }

    /// Settles one outstanding fetch that was cancelled before it produced anything.
    pub fn abandon(&self) -> bool {
        self.update(SlotInner::settle)
    }

    pub fn connected(&self) -> bool {
        self.update(|inner| {
            inner.settle();
            inner.state.connected = true;
            inner.state.error = None;
        })
    }

    pub fn disconnected(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(|inner| {
            inner.settle();
            inner.state.connected = false;
            inner.state.error = Some(error);
        })
    }
}

/// The unified metric map: name → slot.
#[derive(Debug, Default)]
pub struct MetricBoard {
    slots: BTreeMap<String, Arc<MetricSlot>>,
}

impl MetricBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, lifecycle: Lifecycle) -> Arc<MetricSlot> {
        let slot = Arc::new(MetricSlot::new(name, lifecycle));
        self.slots.insert(name.to_string(), slot.clone());
        slot
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MetricSlot>> {
        self.slots.get(name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricState> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.snapshot()))
            .collect()
    }

    pub fn is_loading(&self) -> bool {
        self.slots.values().any(|s| s.snapshot().loading)
    }

    pub fn has_errors(&self) -> bool {
        self.slots.values().any(|s| s.snapshot().error.is_some())
    }
}
