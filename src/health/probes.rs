use std::sync::Arc;
use tokio::sync::watch;

use crate::sensing::ForegroundFeed;

use super::Heartbeat;

/// Whether the realtime foreground introspection channel is bound.
pub trait IntrospectionProbe: Send + Sync {
    fn is_bound(&self) -> bool;
}

impl IntrospectionProbe for ForegroundFeed {
    fn is_bound(&self) -> bool {
        ForegroundFeed::is_bound(self)
    }
}

/// Whether the realtime transport towards the backend is connected.
pub trait TransportProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Used by the overlay to decide whether anything is still enforcing.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Connectivity flag maintained by whoever talks to the backend.
#[derive(Clone)]
pub struct TransportStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns whether the flag changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl TransportProbe for TransportStatus {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Enforcement is alive while the tracking loop keeps beating and, when the
/// agent depends on it, the introspection channel is bound.
pub struct EnforcementLiveness {
    introspection: Option<Arc<dyn IntrospectionProbe>>,
    heartbeat: Heartbeat,
}

impl EnforcementLiveness {
    pub fn new(introspection: Arc<dyn IntrospectionProbe>, heartbeat: Heartbeat) -> Self {
        Self {
            introspection: Some(introspection),
            heartbeat,
        }
    }

    /// For hosts that only have the batch usage-stats fallback.
    pub fn heartbeat_only(heartbeat: Heartbeat) -> Self {
        Self {
            introspection: None,
            heartbeat,
        }
    }
}

impl LivenessProbe for EnforcementLiveness {
    fn is_alive(&self) -> bool {
        self.heartbeat.is_fresh()
            && self
                .introspection
                .as_ref()
                .map_or(true, |probe| probe.is_bound())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn liveness_requires_binding_and_fresh_heartbeat() {
        let feed = ForegroundFeed::new();
        let heartbeat = Heartbeat::new(Duration::from_secs(30));
        let liveness = EnforcementLiveness::new(Arc::new(feed.clone()), heartbeat.clone());

        heartbeat.beat();
        assert!(!liveness.is_alive(), "unbound feed");

        let publisher = feed.bind();
        assert!(liveness.is_alive());

        drop(publisher);
        assert!(!liveness.is_alive());
    }

    #[test]
    fn heartbeat_only_liveness_ignores_binding() {
        let heartbeat = Heartbeat::new(Duration::from_secs(30));
        let liveness = EnforcementLiveness::heartbeat_only(heartbeat.clone());
        assert!(!liveness.is_alive());
        heartbeat.beat();
        assert!(liveness.is_alive());
    }

    #[test]
    fn transport_status_reports_changes() {
        let status = TransportStatus::new();
        assert!(!status.is_connected());
        assert!(status.set_connected(true));
        assert!(!status.set_connected(true));
        assert!(status.is_connected());
    }
}
