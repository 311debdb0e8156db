use std::fmt;

/// The CORE's typed failure surface. The dispatcher matches on these variants rather than
/// inspecting error strings, per the propagation policy each module documents locally.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no upstream available for this request")]
    NoUpstreams,

    #[error("protocol is not supported for CONNECT tunneling: {0}")]
    UnsupportedProtocol(&'static str),

    #[error("inbound proxy authentication is required")]
    AuthRequired,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("upstream health probe failed: {0}")]
    UpstreamStatus(String),

    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("store operation failed transiently: {0}")]
    StoreTransient(String),

    #[error("store operation failed permanently: {0}")]
    StoreFatal(String),
}

impl CoreError {
    /// Whether this failure should ever be retried against another upstream or attempt.
    pub fn is_retryable_upstream_error(&self) -> bool {
        matches!(self, CoreError::UpstreamTransport(_))
    }
}

/// Outcome of a single per-upstream dispatch attempt, used by the tracker and by error
/// classification in the health checker (§4.4).
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub message: String,
}

impl AttemptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Enrich a raw transport error message the way §4.4 classifies health-probe failures.
    pub fn classify(raw: &str) -> String {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("x509:") || lower.contains("tls:") || lower.contains("certificate") {
            format!("TLS/SSL error: {raw}")
        } else if lower.contains("timeout") || lower.contains("timed out") {
            "Connection timeout".to_string()
        } else if lower.contains("connection refused") {
            "Connection refused – proxy may be offline".to_string()
        } else {
            raw.to_string()
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
