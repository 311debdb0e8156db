//! Inbound-facing middleware (§4.5): Basic auth gate and per-IP token-bucket rate limiting.
//! Both read their configuration from the live `Settings` snapshot so a `ReloadSettings` call
//! takes effect on the next request without restarting the listener.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{HeaderMap, HeaderValue};

use crate::errors::CoreError;

const BUCKET_CLEANUP_THRESHOLD: usize = 10_000;

/// Validates and strips the inbound `Proxy-Authorization` header (§4.5).
pub struct AuthGate;

impl AuthGate {
    /// Returns `Ok(())` and leaves `headers` untouched on success aside from removing the
    /// credential header; returns `CoreError::AuthRequired` otherwise.
    pub fn check(headers: &mut HeaderMap, username: &str, password: &str) -> Result<(), CoreError> {
        let header = headers.remove("proxy-authorization");
        let expected = format!("{username}:{password}");
        let expected_b64 = BASE64.encode(expected.as_bytes());

        match header {
            Some(value) => {
                let value = value.to_str().unwrap_or("");
                let provided = value.strip_prefix("Basic ").unwrap_or("");
                if provided == expected_b64 {
                    Ok(())
                } else {
                    Err(CoreError::AuthRequired)
                }
            }
            None => Err(CoreError::AuthRequired),
        }
    }

    pub fn challenge_header_value() -> HeaderValue {
        HeaderValue::from_static("Basic realm=\"proxy\"")
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client IP (§4.5). `interval_s`/`max_requests` define both the
/// bucket capacity and its refill rate: a full bucket refills to `max_requests` every
/// `interval_s` seconds.
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Ok(())` if the request is allowed, `CoreError::RateLimited` otherwise.
    pub fn check(&self, ip: IpAddr, interval_s: u64, max_requests: u64) -> Result<(), CoreError> {
        let capacity = max_requests as f64;
        let refill_rate = capacity / interval_s.max(1) as f64; // tokens per second

        let mut buckets = self.buckets.lock().expect("poisoned");
        if buckets.len() > BUCKET_CLEANUP_THRESHOLD {
            let now = Instant::now();
            buckets.retain(|_, b| now.duration_since(b.last_refill) < Duration::from_secs(interval_s.max(1) * 10));
        }

        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(CoreError::RateLimited)
        }
    }

    /// Clears every bucket unconditionally. Called on `ReloadSettings` so a changed limit takes
    /// effect immediately rather than honoring stale token counts.
    pub fn reset(&self) {
        self.buckets.lock().expect("poisoned").clear();
    }

    /// Drops buckets idle for more than ten times their own interval, but only once the map
    /// has grown past `BUCKET_CLEANUP_THRESHOLD` (§4.5 periodic maintenance). Unlike `reset`,
    /// this never touches a bucket still within its configured window, so it can run
    /// unconditionally on a timer without weakening every client's live allowance.
    pub fn prune_if_over_threshold(&self, interval_s: u64) {
        let mut buckets = self.buckets.lock().expect("poisoned");
        if buckets.len() <= BUCKET_CLEANUP_THRESHOLD {
            return;
        }
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < Duration::from_secs(interval_s.max(1) * 10));
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the client IP per §4.5: `X-Forwarded-For` (first hop) takes priority, then
/// `X-Real-IP`, then the TCP peer address.
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(text) = value.to_str() {
            if let Some(first) = text.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
    }
    if let Some(value) = headers.get("x-real-ip") {
        if let Ok(text) = value.to_str() {
            if let Ok(ip) = text.trim().parse() {
                return ip;
            }
        }
    }
    peer
}
