//! Upstream selection strategies (§4.2, §9 design note: one dispatch point over a sum type).
//!
//! The snapshot of eligible upstreams is rebuilt from the `Store` on a timer (see `watcher.rs`)
//! and published through an `ArcSwap` so `select()` never takes a lock on the hot path. Filtering
//! (status, allowed protocols, response-time ceiling, success-rate floor) happens once per
//! refresh, not per request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;

use crate::config::RotationMethod;
use crate::errors::CoreError;
use crate::model::{Upstream, UpstreamStatus};
use crate::store::Settings;

/// A filtered, ready-to-select pool of upstreams. Rebuilt wholesale on every refresh.
#[derive(Debug)]
struct Pool {
    upstreams: Vec<Arc<Upstream>>,
}

impl Pool {
    fn build(all: &[Arc<Upstream>], settings: &Settings) -> Self {
        let upstreams = all
            .iter()
            .filter(|u| matches!(u.stats.status(), UpstreamStatus::Idle | UpstreamStatus::Active))
            .filter(|u| {
                settings.allowed_protocols.is_empty() || settings.allowed_protocols.contains(&u.scheme)
            })
            .filter(|u| {
                settings.max_response_time_ms == 0
                    || u.stats.avg_response_time_ms() <= settings.max_response_time_ms as f64
            })
            .filter(|u| match u.stats.success_rate() {
                None => true,
                Some(rate) => rate >= settings.min_success_rate,
            })
            .cloned()
            .collect();
        Self { upstreams }
    }
}

/// The four rotation strategies named by §4.2, sharing one `select`/`refresh` entry point.
pub struct Selector {
    method: AtomicU64,
    pool: ArcSwap<Pool>,
    round_robin_cursor: AtomicU64,
    time_based_interval_s: AtomicU64,
}

fn method_code(method: RotationMethod) -> u64 {
    match method {
        RotationMethod::Random => 0,
        RotationMethod::RoundRobin => 1,
        RotationMethod::LeastConn => 2,
        RotationMethod::TimeBased => 3,
    }
}

fn method_from_code(code: u64) -> RotationMethod {
    match code {
        1 => RotationMethod::RoundRobin,
        2 => RotationMethod::LeastConn,
        3 => RotationMethod::TimeBased,
        _ => RotationMethod::Random,
    }
}

impl Selector {
    pub fn new(method: RotationMethod, time_based_interval_s: u64) -> Self {
        Self {
            method: AtomicU64::new(method_code(method)),
            pool: ArcSwap::from_pointee(Pool { upstreams: Vec::new() }),
            round_robin_cursor: AtomicU64::new(0),
            time_based_interval_s: AtomicU64::new(time_based_interval_s.max(1)),
        }
    }

    /// Rebuild the eligible pool from the current upstream list and settings. Also adopts
    /// `settings`' rotation method and interval so a `ReloadSettings` call takes effect without
    /// rebuilding the selector itself (§9 `ReloadSettings`).
    pub fn refresh(&self, all: &[Arc<Upstream>], settings: &Settings) {
        self.method.store(method_code(settings.rotation_method), Ordering::Relaxed);
        self.time_based_interval_s
            .store(settings.time_based_interval_s.max(1), Ordering::Relaxed);
        self.pool.store(Arc::new(Pool::build(all, settings)));
    }

    pub fn select(&self) -> Result<Arc<Upstream>, CoreError> {
        let pool = self.pool.load();
        if pool.upstreams.is_empty() {
            return Err(CoreError::NoUpstreams);
        }

        let method = method_from_code(self.method.load(Ordering::Relaxed));
        let chosen = match method {
            RotationMethod::Random => {
                let mut rng = rand::rng();
                pool.upstreams
                    .choose(&mut rng)
                    .expect("non-empty pool checked above")
                    .clone()
            }
            RotationMethod::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize
                    % pool.upstreams.len();
                pool.upstreams[idx].clone()
            }
            RotationMethod::LeastConn => pool
                .upstreams
                .iter()
                .min_by_key(|u| u.stats.requests())
                .expect("non-empty pool checked above")
                .clone(),
            RotationMethod::TimeBased => {
                let interval = self.time_based_interval_s.load(Ordering::Relaxed);
                let slot = epoch_seconds() / interval;
                let idx = (slot as usize) % pool.upstreams.len();
                pool.upstreams[idx].clone()
            }
        };

        Ok(chosen)
    }
}

fn epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Scheme, UpstreamId};

    fn upstream(id: u64) -> Arc<Upstream> {
        Arc::new(Upstream::new(UpstreamId(id), format!("127.0.0.1:{}", 9000 + id), Scheme::Http))
    }

    fn default_settings() -> Settings {
        crate::config::AppConfig::from_toml_str(
            r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
"#,
        )
        .map(|c| Settings::from_config(&c))
        .unwrap()
    }

    #[test]
    fn empty_pool_errors_no_upstreams() {
        let selector = Selector::new(RotationMethod::Random, 60);
        let err = selector.select().unwrap_err();
        assert!(matches!(err, CoreError::NoUpstreams));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let selector = Selector::new(RotationMethod::RoundRobin, 60);
        let all = vec![upstream(1), upstream(2), upstream(3)];
        selector.refresh(&all, &default_settings());

        let picks: Vec<_> = (0..6).map(|_| selector.select().unwrap().id).collect();
        assert_eq!(
            picks,
            vec![
                all[0].id, all[1].id, all[2].id, all[0].id, all[1].id, all[2].id
            ]
        );
    }

    #[test]
    fn least_conn_prefers_fewest_requests() {
        let selector = Selector::new(RotationMethod::LeastConn, 60);
        let busy = upstream(1);
        let idle = upstream(2);
        busy.stats.record(true, 10, None, true);
        busy.stats.record(true, 10, None, true);
        let all = vec![busy.clone(), idle.clone()];
        selector.refresh(&all, &default_settings());

        assert_eq!(selector.select().unwrap().id, idle.id);
    }

    #[test]
    fn failed_upstreams_are_excluded_from_pool() {
        let selector = Selector::new(RotationMethod::Random, 60);
        let healthy = upstream(1);
        let failed = upstream(2);
        for _ in 0..3 {
            failed.stats.record(false, 5, Some("e".into()), true);
        }
        let all = vec![healthy.clone(), failed.clone()];
        selector.refresh(&all, &default_settings());

        for _ in 0..10 {
            assert_eq!(selector.select().unwrap().id, healthy.id);
        }
    }

    #[test]
    fn allowed_protocols_filter_narrows_pool() {
        let selector = Selector::new(RotationMethod::Random, 60);
        let http_up = upstream(1);
        let socks_up = Arc::new(Upstream::new(UpstreamId(2), "127.0.0.1:9100".into(), Scheme::Socks5));
        let mut settings = default_settings();
        settings.allowed_protocols = [Scheme::Socks5].into_iter().collect();

        selector.refresh(&[http_up.clone(), socks_up.clone()], &settings);
        for _ in 0..10 {
            assert_eq!(selector.select().unwrap().id, socks_up.id);
        }
    }
}
