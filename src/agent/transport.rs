use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    health::TransportStatus,
    models::Rule,
    policy::{PolicyError, PolicyFetcher},
};

/// Derives transport connectivity from policy fetch results. A rejected
/// payload still proves the transport works.
pub struct ObservedFetcher {
    inner: Arc<dyn PolicyFetcher>,
    status: TransportStatus,
}

impl ObservedFetcher {
    pub fn new(inner: Arc<dyn PolicyFetcher>, status: TransportStatus) -> Self {
        Self { inner, status }
    }
}

#[async_trait]
impl PolicyFetcher for ObservedFetcher {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, PolicyError> {
        let result = self.inner.fetch_rules().await;
        let connected = match &result {
            Ok(_) | Err(PolicyError::Invalid(_)) => true,
            Err(PolicyError::Unavailable(_)) | Err(PolicyError::Io(_)) => false,
        };
        if self.status.set_connected(connected) {
            log::info!(
                "transport {}",
                if connected { "connected" } else { "disconnected" }
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::TransportProbe;

    struct Fixed(fn() -> Result<Vec<Rule>, PolicyError>);

    #[async_trait]
    impl PolicyFetcher for Fixed {
        async fn fetch_rules(&self) -> Result<Vec<Rule>, PolicyError> {
            (self.0)()
        }
    }

    #[tokio::test]
    async fn tracks_connectivity_from_fetch_results() {
        let status = TransportStatus::new();

        let ok = ObservedFetcher::new(Arc::new(Fixed(|| Ok(Vec::new()))), status.clone());
        ok.fetch_rules().await.unwrap();
        assert!(status.is_connected());

        let offline = ObservedFetcher::new(
            Arc::new(Fixed(|| Err(PolicyError::Unavailable("offline".into())))),
            status.clone(),
        );
        assert!(offline.fetch_rules().await.is_err());
        assert!(!status.is_connected());

        let invalid = ObservedFetcher::new(
            Arc::new(Fixed(|| Err(PolicyError::Invalid("bad json".into())))),
            status.clone(),
        );
        assert!(invalid.fetch_rules().await.is_err());
        assert!(status.is_connected());
    }
}
