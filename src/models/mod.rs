pub mod rule;
pub mod usage;
pub mod verdict;

pub use rule::{Rule, RuleType};
pub use usage::UsageRecord;
pub use verdict::{BlockReason, EnforcementVerdict};
