//! Request dispatch with retry/fallback (§4.1).
//!
//! The F/R state machine: `F` is how many distinct upstreams get tried (`fallback_max_retries`
//! if `fallback` is enabled, else 1 — no fallback means only the first selected upstream is
//! ever attempted) and `R` is how many times each selected upstream itself gets retried
//! (`max(retries, 1)`). A re-pick of an already-tried upstream (likely with a pool smaller than
//! `F`) is skipped without consuming an `F` slot. The first successful attempt short-circuits
//! the whole thing; exhausting every (upstream, retry) slot yields a synthetic 502.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, Method, Response, StatusCode, Uri};
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::model::Upstream;
use crate::selector::Selector;
use crate::store::Settings;
use crate::tracker::UsageTracker;
use crate::transport::{Transport, TransportFactory};

/// Headers stripped before forwarding, per hop-by-hop rules plus whatever the inbound
/// `Connection` header itself names (§4.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_REDIRECTS: usize = 10;

/// A fully-buffered request ready to be replayed against any number of upstreams. The server
/// layer collects the inbound body into `Bytes` before handing this to the dispatcher so the
/// same request can be retried without re-reading a streaming body.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Remove hop-by-hop headers and anything the `Connection` header itself names.
    pub fn sanitize(mut self) -> Self {
        let connection_listed: Vec<String> = self
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
            .unwrap_or_default();

        for name in HOP_BY_HOP {
            self.headers.remove(*name);
        }
        for name in connection_listed {
            if let Ok(header_name) = HeaderName::try_from(name) {
                self.headers.remove(header_name);
            }
        }
        self
    }
}

pub struct DispatchOutcome {
    pub response: Response<Bytes>,
    pub upstream: Arc<Upstream>,
}

pub struct Dispatcher {
    selector: Arc<Selector>,
    tracker: Arc<UsageTracker>,
}

impl Dispatcher {
    pub fn new(selector: Arc<Selector>, tracker: Arc<UsageTracker>) -> Self {
        Self { selector, tracker }
    }

    pub async fn dispatch(
        &self,
        request: OutboundRequest,
        settings: &Settings,
    ) -> Result<DispatchOutcome, CoreError> {
        let request = request.sanitize();
        let fallback_slots = if settings.fallback {
            settings.fallback_max_retries.max(1)
        } else {
            1
        };
        let retries_per_upstream = settings.retries.max(1);
        let timeout = Duration::from_secs(settings.timeout_s);

        let mut last_error: Option<CoreError> = None;
        let mut tried: HashSet<crate::model::UpstreamId> = HashSet::new();
        let mut slots_used = 0;
        // Cap total selector draws generously above fallback_slots so that re-picks of an
        // already-tried upstream (common with a pool smaller than fallback_slots) don't starve
        // the loop of its real F budget.
        let max_draws = fallback_slots.saturating_mul(4).max(fallback_slots + 8);

        for _draw in 0..max_draws {
            if slots_used >= fallback_slots {
                break;
            }
            let upstream = match self.selector.select() {
                Ok(u) => u,
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            };

            if !tried.insert(upstream.id) {
                debug!(upstream = %upstream.address, "already tried this upstream, redrawing without consuming a fallback slot");
                continue;
            }
            slots_used += 1;

            for _attempt in 0..retries_per_upstream {
                let start = Instant::now();
                let outcome = self
                    .attempt_once(&upstream, request.clone(), timeout, settings.follow_redirect)
                    .await;
                let elapsed_ms = start.elapsed().as_millis() as u64;

                match outcome {
                    Ok(response) => {
                        self.tracker.record_request(
                            upstream.clone(),
                            request.method.to_string(),
                            request.uri.to_string(),
                            response.status().as_u16(),
                            true,
                            elapsed_ms,
                            None,
                            settings.remove_unhealthy,
                        );
                        return Ok(DispatchOutcome { response, upstream });
                    }
                    Err(CoreError::ClientCancelled) => return Err(CoreError::ClientCancelled),
                    Err(err) => {
                        self.tracker.record_request(
                            upstream.clone(),
                            request.method.to_string(),
                            request.uri.to_string(),
                            0,
                            false,
                            elapsed_ms,
                            Some(err.to_string()),
                            settings.remove_unhealthy,
                        );
                        debug!(upstream = %upstream.address, error = %err, "attempt failed");
                        last_error = Some(err);
                    }
                }
            }
        }

        warn!(error = ?last_error, "all upstream attempts exhausted");
        Err(last_error.unwrap_or(CoreError::NoUpstreams))
    }

    async fn attempt_once(
        &self,
        upstream: &Upstream,
        request: OutboundRequest,
        timeout: Duration,
        follow_redirect: bool,
    ) -> Result<Response<Bytes>, CoreError> {
        let transport = TransportFactory::build(upstream, timeout)
            .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

        let mut current = request;
        let mut redirects = 0;

        loop {
            let response = match &transport {
                Transport::Reqwest(client) => send_via_reqwest(client, &current).await?,
                Transport::Socks4Hyper { upstream } => {
                    send_via_socks4(upstream, &current).await?
                }
            };

            if !follow_redirect || !response.status().is_redirection() {
                return Ok(response);
            }

            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(CoreError::UpstreamTransport(
                    "exceeded maximum redirect hops".to_string(),
                ));
            }

            let location = response
                .headers()
                .get(http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| CoreError::UpstreamTransport("redirect missing Location".to_string()))?;
            let next_uri: Uri = resolve_redirect(&current.uri, location)
                .map_err(|e| CoreError::UpstreamTransport(format!("invalid redirect target: {e}")))?;
            current.uri = next_uri;
        }
    }
}

fn resolve_redirect(base: &Uri, location: &str) -> Result<Uri, http::uri::InvalidUri> {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.parse()
    } else {
        let authority = base.authority().map(|a| a.as_str()).unwrap_or("");
        let scheme = base.scheme_str().unwrap_or("http");
        format!("{scheme}://{authority}{location}").parse()
    }
}

async fn send_via_reqwest(
    client: &reqwest::Client,
    request: &OutboundRequest,
) -> Result<Response<Bytes>, CoreError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;
    let mut builder = client.request(method, request.uri.to_string());
    for (name, value) in request.headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().expect("fresh builder has headers") = headers;
    builder
        .body(body)
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))
}

async fn send_via_socks4(
    upstream: &Upstream,
    request: &OutboundRequest,
) -> Result<Response<Bytes>, CoreError> {
    use http_body_util::{BodyExt, Full};

    let mut builder = hyper::Request::builder()
        .method(request.method.clone())
        .uri(request.uri.clone());
    for (name, value) in request.headers.iter() {
        builder = builder.header(name, value);
    }
    let hyper_request = builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

    let response = crate::transport::socks4_request(upstream, hyper_request).await?;
    let (parts, body) = response.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?
        .to_bytes();
    Ok(Response::from_parts(parts, collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationMethod;
    use crate::store::MemoryStore;

    fn settings() -> Settings {
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
    fn sanitize_strips_hop_by_hop_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, "X-Custom-Drop".parse().unwrap());
        headers.insert("x-custom-drop", "gone".parse().unwrap());
        headers.insert("proxy-authorization", "Basic abc".parse().unwrap());
        headers.insert("x-keep", "kept".parse().unwrap());

        let request = OutboundRequest {
            method: Method::GET,
            uri: "http://example.com/".parse().unwrap(),
            headers,
            body: Bytes::new(),
        }
        .sanitize();

        assert!(!request.headers.contains_key("connection"));
        assert!(!request.headers.contains_key("proxy-authorization"));
        assert!(!request.headers.contains_key("x-custom-drop"));
        assert!(request.headers.contains_key("x-keep"));
    }

    #[tokio::test]
    async fn dispatch_returns_no_upstreams_when_pool_empty() {
        let config = crate::config::AppConfig::from_toml_str(
            r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
"#,
        )
        .unwrap();
        let store: Arc<dyn crate::store::Store> =
            Arc::new(MemoryStore::from_config(&config).unwrap());
        let tracker = Arc::new(UsageTracker::new(store.clone()));
        let selector = Arc::new(Selector::new(RotationMethod::Random, 60));
        // selector never refreshed: pool stays empty
        let dispatcher = Dispatcher::new(selector, tracker);

        let request = OutboundRequest {
            method: Method::GET,
            uri: "http://example.com/".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let err = dispatcher.dispatch(request, &settings()).await.unwrap_err();
        assert!(matches!(err, CoreError::NoUpstreams));
    }
}
