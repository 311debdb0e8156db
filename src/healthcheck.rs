//! Health probing (§4.4): periodically verify each upstream still reaches the configured probe
//! URL, classify failures, and feed the result back through the tracker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderName, HeaderValue};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::model::Upstream;
use crate::store::{Settings, Store};
use crate::tracker::UsageTracker;
use crate::transport::{Transport, TransportFactory};

pub struct HealthChecker {
    store: Arc<dyn Store>,
    tracker: Arc<UsageTracker>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckOutcome {
    pub upstream_id: crate::model::UpstreamId,
    pub success: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn Store>, tracker: Arc<UsageTracker>) -> Self {
        Self { store, tracker }
    }

    /// Probe a single upstream against `settings.healthcheck_url`, classifying the result
    /// through the tracker and returning whether it transitioned the upstream to `failed`.
    pub async fn check_one(&self, upstream: &Upstream, settings: &Settings) -> bool {
        let start = Instant::now();
        let outcome = probe(upstream, settings).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(status) if status == settings.healthcheck_expected_status => {
                self.tracker
                    .record_health_check(upstream, true, elapsed_ms, None, settings.remove_unhealthy)
            }
            Ok(status) => self.tracker.record_health_check(
                upstream,
                false,
                elapsed_ms,
                Some(format!("unexpected status {status}")),
                settings.remove_unhealthy,
            ),
            Err(err) => {
                debug!(upstream = %upstream.address, error = %err, "health probe failed");
                self.tracker
                    .record_health_check(upstream, false, elapsed_ms, Some(err), settings.remove_unhealthy)
            }
        }
    }

    /// Probe every known upstream concurrently, bounded by `settings.healthcheck_workers`. A
    /// single upstream's failure never cancels the others in flight (§4.4).
    pub async fn check_all(&self) -> Vec<HealthCheckOutcome> {
        let settings = match self.store.get_settings().await {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "could not load settings for health check sweep");
                return Vec::new();
            }
        };
        let upstreams = match self.store.list_upstreams().await {
            Ok(u) => u,
            Err(err) => {
                warn!(error = %err, "could not list upstreams for health check sweep");
                return Vec::new();
            }
        };

        let workers = settings.healthcheck_workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let store = self.store.clone();
        let tracker = self.tracker.clone();

        let mut join_set = tokio::task::JoinSet::new();
        for upstream in upstreams {
            let settings = settings.clone();
            let semaphore = semaphore.clone();
            let tracker = tracker.clone();
            let store = store.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let checker = HealthChecker { store, tracker };
                let id = upstream.id;
                let became_failed = checker.check_one(&upstream, &settings).await;
                HealthCheckOutcome {
                    upstream_id: id,
                    success: !became_failed,
                    response_time_ms: 0,
                    error: None,
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(err) => warn!(error = %err, "health check task panicked"),
            }
        }
        results
    }

    /// Run `check_all` on a fixed interval until the process shuts down.
    pub async fn start_periodic(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcomes = self.check_all().await;
            debug!(count = outcomes.len(), "health check sweep complete");
        }
    }
}

async fn probe(upstream: &Upstream, settings: &Settings) -> Result<u16, String> {
    let timeout = Duration::from_secs(settings.healthcheck_timeout_s);
    let transport = TransportFactory::build(upstream, timeout).map_err(|e| e.to_string())?;

    match transport {
        Transport::Reqwest(client) => {
            let mut request = client.get(&settings.healthcheck_url);
            for (name, value) in &settings.healthcheck_headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    request = request.header(name, value);
                }
            }
            let response = request.send().await.map_err(|e| e.to_string())?;
            Ok(response.status().as_u16())
        }
        Transport::Socks4Hyper { upstream } => {
            let url: url::Url = settings
                .healthcheck_url
                .parse()
                .map_err(|e| format!("invalid healthcheck url: {e}"))?;
            let mut builder = hyper::Request::builder()
                .method("GET")
                .uri(url.as_str());
            for (name, value) in &settings.healthcheck_headers {
                builder = builder.header(name, value);
            }
            let request = builder
                .body(http_body_util::Full::new(bytes::Bytes::new()))
                .map_err(|e| e.to_string())?;
            let response = crate::transport::socks4_request(&upstream, request)
                .await
                .map_err(|e| e.to_string())?;
            Ok(response.status().as_u16())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{Scheme, UpstreamId};
    use crate::store::MemoryStore;

    fn store_and_tracker() -> (Arc<dyn Store>, Arc<UsageTracker>) {
        let config = AppConfig::from_toml_str(
            r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
"#,
        )
        .unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::from_config(&config).unwrap());
        let tracker = Arc::new(UsageTracker::new(store.clone()));
        (store, tracker)
    }

    #[tokio::test]
    async fn check_one_records_failure_when_upstream_unreachable() {
        let (store, tracker) = store_and_tracker();
        let checker = HealthChecker::new(store.clone(), tracker);
        let settings = store.get_settings().await.unwrap();
        // port 1 is reserved and should refuse connections immediately
        let upstream = Upstream::new(UpstreamId(1), "127.0.0.1:1".into(), Scheme::Http);

        checker.check_one(&upstream, &settings).await;
        let snap = upstream.stats.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.successful_requests, 0);
    }
}
