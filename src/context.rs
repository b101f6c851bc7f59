//! # Dashboard context
//! Explicit wiring handed to every component of one dashboard instance:
//! the request gateway, the stream connector, timing knobs and the shared
//! lifecycle flag. Nothing here is global, so several dashboards can run
//! side by side and be torn down independently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::gateway::Gateway;
use crate::sse::StreamConnector;

/// Shared "torn down" flag. Every state write checks it first, so a late
/// response or handler after teardown is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    closed: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the lifecycle closed. Returns `true` only for the call that
    /// actually performed the transition.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Fixed retry/probe timings. No backoff and no jitter: every retry waits
/// exactly `reconnect_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub reconnect_delay: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            health_interval: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct DashboardContext {
    pub gateway: Arc<dyn Gateway>,
    pub connector: Arc<dyn StreamConnector>,
    pub timings: Timings,
    pub lifecycle: Lifecycle,
}

impl DashboardContext {
    pub fn new(gateway: Arc<dyn Gateway>, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            gateway,
            connector,
            timings: Timings::default(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }
}

/// Arena of cancellable background tasks keyed by name. Teardown is one sweep.
#[derive(Debug, Default)]
pub struct TaskArena {
    inner: Mutex<ArenaInner>,
}

#[derive(Debug, Default)]
struct ArenaInner {
    tasks: HashMap<String, JoinHandle<()>>,
    swept: bool,
}

impl TaskArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` under `key`. A task already registered under the same key is
    /// aborted. After [`TaskArena::abort_all`] nothing is spawned anymore.
    pub fn spawn<F>(&self, key: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut inner = self.inner.lock().expect("task arena mutex poisoned");
        if inner.swept {
            tracing::debug!(target: "dashboard", task = %key, "arena already swept, not spawning");
            return;
        }
        let handle = tokio::spawn(fut);
        if let Some(old) = inner.tasks.insert(key, handle) {
            old.abort();
        }
    }

    /// Abort every registered task. Returns how many were aborted; later calls return 0.
    pub fn abort_all(&self) -> usize {
        let mut inner = self.inner.lock().expect("task arena mutex poisoned");
        inner.swept = true;
        let n = inner.tasks.len();
        for (_, handle) in inner.tasks.drain() {
            handle.abort();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("task arena mutex poisoned")
            .tasks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_close_reports_first_transition_only() {
        let lc = Lifecycle::new();
        let other = lc.clone();
        assert!(!other.is_closed());
        assert!(lc.close());
        assert!(!lc.close());
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn arena_sweep_is_idempotent_and_blocks_new_tasks() {
        let arena = TaskArena::new();
        arena.spawn("a", std::future::pending());
        arena.spawn("b", std::future::pending());
        // same key replaces (and aborts) the previous task
        arena.spawn("b", std::future::pending());
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.abort_all(), 2);
        assert_eq!(arena.abort_all(), 0);

        arena.spawn("c", std::future::pending());
        assert!(arena.is_empty());
    }
}
