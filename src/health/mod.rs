//! In-process health checks: introspection binding, transport connectivity
//! and tracker liveness, with backed-off self-repair escalation.

pub mod backoff;
pub mod heartbeat;
pub mod monitor;
pub mod probes;

pub use backoff::EscalationBackoff;
pub use heartbeat::Heartbeat;
pub use monitor::{HealthAction, HealthMonitor, HealthReport};
pub use probes::{
    EnforcementLiveness, IntrospectionProbe, LivenessProbe, TransportProbe, TransportStatus,
};
