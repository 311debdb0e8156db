//! Background tickers (ambient C10): keep the selector's pool fresh against the store and
//! periodically trim idle rate-limit buckets.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::middleware::RateLimiter;
use crate::selector::Selector;
use crate::store::Store;

const POOL_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const BUCKET_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Re-reads the upstream list and settings from the store and republishes the selector's
/// snapshot. Runs until the process exits; the caller spawns this as its own task.
pub async fn run_pool_refresh(store: Arc<dyn Store>, selector: Arc<Selector>) {
    let mut ticker = tokio::time::interval(POOL_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match (store.list_upstreams().await, store.get_settings().await) {
            (Ok(upstreams), Ok(settings)) => {
                selector.refresh(&upstreams, &settings);
                debug!(count = upstreams.len(), "refreshed upstream selection pool");
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "failed to refresh selection pool, keeping previous snapshot");
            }
        }
    }
}

/// Periodically prunes idle rate-limit buckets once the map has grown past the size threshold
/// (§4.5), so long-running processes with many distinct client IPs don't grow the bucket map
/// unbounded. Unlike `RateLimiter::reset`, this never wipes a bucket still within its configured
/// window, so active clients keep their live allowance between ticks.
pub async fn run_bucket_cleanup(store: Arc<dyn Store>, limiter: Arc<RateLimiter>) {
    let mut ticker = tokio::time::interval(BUCKET_CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let interval_s = match store.get_settings().await {
            Ok(settings) => settings.rate_limit_interval_s,
            Err(err) => {
                warn!(error = %err, "failed to load settings for bucket cleanup, skipping this sweep");
                continue;
            }
        };
        limiter.prune_if_over_threshold(interval_s);
        debug!("rate limit bucket cleanup swept");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, RotationMethod};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn pool_refresh_populates_selector_once() {
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
        let selector = Arc::new(Selector::new(RotationMethod::Random, 60));

        let upstreams = store.list_upstreams().await.unwrap();
        let settings = store.get_settings().await.unwrap();
        selector.refresh(&upstreams, &settings);

        assert!(selector.select().is_ok());
    }
}
