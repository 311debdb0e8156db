//! Usage tracking (§4.3): turns dispatch/health-check outcomes into `UpstreamStats` updates and
//! a persisted `RequestRecord`, decoupled from the request's own deadline.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::errors::AttemptError;
use crate::model::{RequestRecord, Upstream, UpstreamStatus};
use crate::store::Store;

/// Tracker writes happen on their own short deadline so a slow store never holds up the
/// response the client already received (§4.3).
const TRACKER_WRITE_DEADLINE: Duration = Duration::from_secs(5);

pub struct UsageTracker {
    store: Arc<dyn Store>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record one dispatch attempt against an upstream's stats and persist the request record.
    /// Spawned onto its own task so the caller's response path never waits on it.
    pub fn record_request(
        &self,
        upstream: Arc<Upstream>,
        method: String,
        url: String,
        status_code: u16,
        success: bool,
        response_time_ms: u64,
        raw_error: Option<String>,
        remove_unhealthy: bool,
    ) {
        let error_message = raw_error.map(|e| AttemptError::classify(&e));
        upstream
            .stats
            .record(success, response_time_ms, error_message.clone(), remove_unhealthy);

        let store = self.store.clone();
        let record = RequestRecord::now(
            upstream.id,
            upstream.address.clone(),
            method,
            url,
            status_code,
            success,
            response_time_ms,
            error_message,
        );

        tokio::spawn(async move {
            let write = store.record_request(record);
            match tokio::time::timeout(TRACKER_WRITE_DEADLINE, write).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to persist request record"),
                Err(_) => warn!("persisting request record exceeded its write deadline"),
            }
        });
    }

    /// Record a health-check probe outcome (§4.4). Never removed from the pool on a single
    /// failure unless the consecutive-failure threshold is crossed, mirroring dispatch.
    pub fn record_health_check(
        &self,
        upstream: &Upstream,
        success: bool,
        response_time_ms: u64,
        raw_error: Option<String>,
        remove_unhealthy: bool,
    ) -> bool {
        let error_message = raw_error.map(|e| AttemptError::classify(&e));
        upstream
            .stats
            .record(success, response_time_ms, error_message, remove_unhealthy)
    }

    /// Escape-hatch status override (§4.3 `UpdateStatus`), e.g. manual operator action.
    pub async fn update_status(
        &self,
        upstream: &Upstream,
        status: UpstreamStatus,
    ) -> Result<(), crate::errors::CoreError> {
        upstream.stats.set_status(status);
        self.store.update_upstream_status(upstream.id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{Scheme, UpstreamId};
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn Store> {
        let config = AppConfig::from_toml_str(
            r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
"#,
        )
        .unwrap();
        Arc::new(MemoryStore::from_config(&config).unwrap())
    }

    #[tokio::test]
    async fn record_request_updates_stats_and_persists() {
        let tracker = UsageTracker::new(store());
        let upstream = Arc::new(Upstream::new(UpstreamId(1), "127.0.0.1:9001".into(), Scheme::Http));

        tracker.record_request(
            upstream.clone(),
            "GET".into(),
            "http://example.com/".into(),
            200,
            true,
            42,
            None,
            true,
        );

        // allow the spawned persistence task to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream.stats.requests(), 1);
    }

    #[test]
    fn record_health_check_classifies_tls_errors() {
        let tracker = UsageTracker::new(store());
        let upstream = Upstream::new(UpstreamId(1), "127.0.0.1:9001".into(), Scheme::Https);
        let became_failed = tracker.record_health_check(
            &upstream,
            false,
            5,
            Some("x509: certificate has expired".into()),
            true,
        );
        assert!(!became_failed);
        let snap = upstream.stats.snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("TLS/SSL error: x509: certificate has expired"));
    }
}
