//! Foreground sampling, usage attribution and the tracking loop that feeds
//! verdicts to the overlay.

pub mod controller;
pub mod foreground;
pub mod loop_worker;
pub mod probe;
pub mod store;
pub mod tracker;

pub use controller::TrackerController;
pub use foreground::{
    AppLastUsed, ForegroundApp, ForegroundFeed, ForegroundPublisher, NoUsageStats,
    UsageStatsSource,
};
pub use loop_worker::TrackingContext;
pub use probe::CommandForegroundProbe;
pub use store::{MemoryUsageStore, UsageStore};
pub use tracker::{TickOutcome, UsageTracker};
