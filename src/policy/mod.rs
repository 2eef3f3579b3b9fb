//! Policy snapshot cache and the synchronous rule engine evaluated on every
//! foreground change.

pub mod engine;
pub mod refresher;
pub mod schedule;
pub mod source;

pub use engine::{evaluate_snapshot, RuleEngine};
pub use refresher::{PolicyRefresher, RefreshOutcome};
pub use schedule::ScheduleWindow;
pub use source::{
    FilePolicyFetcher, PolicyCache, PolicyError, PolicyFetcher, PolicySnapshot, PolicyStore,
};
