// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod context;
pub mod dashboard;
pub mod feed;
pub mod gateway;
pub mod health;
pub mod poll;
pub mod registry;
pub mod sse;
pub mod state;
pub mod stream;
pub mod telemetry;

// Scripted network stand-ins (tests, demos)
pub mod testing;

// ---- Re-exports for stable public API ----
pub use crate::context::{DashboardContext, Lifecycle, Timings};
pub use crate::dashboard::{Dashboard, DashboardSetup, DashboardSnapshot, RefreshError};
pub use crate::feed::{
    ActivityEvent, ActivityFeed, ActivityFeedConsumer, FeedEndpoints, FeedHandle, FeedPhase,
};
pub use crate::gateway::{Access, Gateway, HttpGateway, HttpReply};
pub use crate::health::{HealthService, OverallHealth, ServiceHealthRecord, ServiceStatus};
pub use crate::registry::{Delivery, MetricSource, SourceRegistry};
pub use crate::state::MetricState;
