//! Layered process supervision: independent recovery triggers armed through
//! a host abstraction, so losing any one mechanism never loses them all.

pub mod coordinator;
pub mod host;
pub mod os_jobs;
pub mod system_host;
pub mod triggers;

pub use coordinator::{ArmReport, Coverage, TriggerOutcome, WatchdogCoordinator};
pub use host::{Host, HostError, JobSchedule, ProcessTarget, ScheduledJob};
pub use os_jobs::OsJobs;
pub use system_host::SystemHost;
pub use triggers::{
    CompanionTrigger, PeriodicJobTrigger, PersistedJobTrigger, RecoveryTrigger, TaskRemovedHook,
    TriggerError, TriggerKind, WakeTimerTrigger,
};
