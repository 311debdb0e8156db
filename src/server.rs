//! Inbound listener and request lifecycle (§4, §9 architecture note).
//!
//! A reverse-proxy `ProxyHttp`-style service assumes a fixed backend chosen per request, but
//! here the backend is whatever upstream the selector hands back and, for CONNECT, the
//! "request" is really "dial a byte tunnel" — a poor fit for a fixed-backend `upstream_peer`
//! hook. The inbound side is therefore a hand-rolled `hyper` listener, while the
//! ArcSwap/selector/tracker plumbing underneath keeps the same overall shape (see DESIGN.md).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::connect::ConnectDispatcher;
use crate::dispatcher::{Dispatcher, OutboundRequest};
use crate::errors::CoreError;
use crate::middleware::{client_ip, AuthGate, RateLimiter};
use crate::selector::Selector;
use crate::store::{Settings, Store};
use crate::tracker::UsageTracker;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ProxyServer {
    store: Arc<dyn Store>,
    tracker: Arc<UsageTracker>,
    selector: Arc<Selector>,
    dispatcher: Arc<Dispatcher>,
    connect_dispatcher: Arc<ConnectDispatcher>,
    rate_limiter: Arc<RateLimiter>,
    settings: Arc<ArcSwap<Settings>>,
    graceful_shutdown: Duration,
    shutdown_notify: Notify,
    inflight: AtomicUsize,
}

impl ProxyServer {
    pub async fn new(store: Arc<dyn Store>, config: &AppConfig) -> anyhow::Result<Self> {
        let settings = store.get_settings().await?;
        let selector = Arc::new(Selector::new(
            settings.rotation_method,
            settings.time_based_interval_s,
        ));
        let upstreams = store.list_upstreams().await?;
        selector.refresh(&upstreams, &settings);

        let tracker = Arc::new(UsageTracker::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(selector.clone(), tracker.clone()));
        let connect_dispatcher = Arc::new(ConnectDispatcher::new(selector.clone(), tracker.clone()));

        Ok(Self {
            store,
            tracker,
            selector,
            dispatcher,
            connect_dispatcher,
            rate_limiter: Arc::new(RateLimiter::new()),
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            graceful_shutdown: Duration::from_secs(config.server.graceful_shutdown_timeout_seconds),
            shutdown_notify: Notify::new(),
            inflight: AtomicUsize::new(0),
        })
    }

    /// Apply a freshly edited settings document in place: refresh the shared selector (which
    /// adopts the new rotation method and interval itself), reset rate-limit buckets so a
    /// changed limit takes effect immediately, and publish the new snapshot (§9
    /// `ReloadSettings`).
    pub async fn reload_settings(&self, new_settings: Settings) -> Result<(), CoreError> {
        let upstreams = self.store.list_upstreams().await?;
        self.selector.refresh(&upstreams, &new_settings);
        self.rate_limiter.reset();
        self.store.update_settings(new_settings.clone()).await?;
        self.settings.store(Arc::new(new_settings));
        Ok(())
    }

    /// How long `shutdown` should wait for in-flight connections to drain (§9
    /// `graceful_shutdown_timeout_seconds`).
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        self.graceful_shutdown
    }

    /// Stop accepting new connections and wait up to `graceful_shutdown_timeout()` for
    /// in-flight ones to finish on their own (§4.7, §9). Connections still open past the
    /// deadline are left to end however their own task ends; this call just stops waiting.
    pub async fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
        let deadline = self.graceful_shutdown_timeout();
        let start = Instant::now();
        loop {
            let inflight = self.inflight.load(Ordering::SeqCst);
            if inflight == 0 {
                break;
            }
            if start.elapsed() >= deadline {
                warn!(inflight, "graceful shutdown deadline reached with connections still in flight");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Shared handle to the selector the background pool-refresh ticker updates.
    pub fn selector_handle(&self) -> Arc<Selector> {
        self.selector.clone()
    }

    /// Shared handle to the rate limiter the background cleanup ticker trims.
    pub fn rate_limiter_handle(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    pub async fn run(self: Arc<Self>, listen_addrs: &[String]) -> anyhow::Result<()> {
        let mut listeners = Vec::new();
        for addr in listen_addrs {
            let socket_addr: SocketAddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid listen address '{addr}': {e}"))?;
            let listener = TcpListener::bind(socket_addr).await?;
            info!(address = %socket_addr, "listening for inbound proxy connections");
            listeners.push(listener);
        }

        let mut join_set = tokio::task::JoinSet::new();
        for listener in listeners {
            let server = self.clone();
            join_set.spawn(async move { server.accept_loop(listener).await });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "listener task panicked");
            }
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "failed to accept inbound connection");
                        continue;
                    }
                },
                _ = self.shutdown_notify.notified() => {
                    info!("listener stopped accepting new connections for shutdown");
                    return Ok(());
                }
            };
            let server = self.clone();
            self.inflight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(err) = server.serve_connection(stream, peer).await {
                    warn!(error = %err, peer = %peer, "connection handling ended with error");
                }
                server.inflight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.handle_request(req, peer).await }
        });

        auto::Builder::new(hyper_util::rt::TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;
        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let settings = self.settings.load_full();
        let ip = client_ip(req.headers(), peer.ip());

        if settings.rate_limit_enabled {
            if self
                .rate_limiter
                .check(ip, settings.rate_limit_interval_s, settings.rate_limit_max_requests)
                .is_err()
            {
                return Ok(plain_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
            }
        }

        let mut req = req;
        if settings.auth_enabled {
            if let Err(_err) =
                AuthGate::check(req.headers_mut(), &settings.auth_username, &settings.auth_password)
            {
                let mut response = plain_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "authentication required");
                response
                    .headers_mut()
                    .insert(http::header::PROXY_AUTHENTICATE, AuthGate::challenge_header_value());
                return Ok(response);
            }
        }

        if req.method() == hyper::Method::CONNECT {
            return Ok(self.handle_connect(req, &settings).await);
        }

        Ok(self.handle_forward(req, &settings).await)
    }

    async fn handle_forward(
        &self,
        req: hyper::Request<Incoming>,
        settings: &Settings,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return plain_response(StatusCode::BAD_REQUEST, &format!("failed to read request body: {err}"));
            }
        };

        let outbound = OutboundRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };

        match self.dispatcher.dispatch(outbound, settings).await {
            Ok(outcome) => {
                let (parts, body) = outcome.response.into_parts();
                Response::from_parts(parts, Full::new(body))
            }
            Err(CoreError::ClientCancelled) => plain_response(StatusCode::BAD_GATEWAY, "client cancelled"),
            Err(err) => plain_response(StatusCode::BAD_GATEWAY, &err.to_string()),
        }
    }

    async fn handle_connect(
        &self,
        req: hyper::Request<Incoming>,
        settings: &Settings,
    ) -> Response<Full<Bytes>> {
        let target = req.uri().to_string();

        let (tunnel, _upstream) = match self.connect_dispatcher.dispatch(&target, settings).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, target = %target, "CONNECT dispatch failed");
                return plain_response(StatusCode::BAD_GATEWAY, "all upstreams failed");
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(err) = splice(upgraded, tunnel).await {
                        warn!(error = %err, "CONNECT tunnel splice ended with error");
                    }
                }
                Err(err) => warn!(error = %err, "failed to take over client connection for CONNECT"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .expect("static response is always valid")
    }
}

async fn splice(upgraded: hyper::upgrade::Upgraded, tunnel: crate::connect::Tunnel) -> anyhow::Result<()> {
    use tokio::io::copy_bidirectional;
    let mut client_io = TokioIo::new(upgraded);
    match tunnel {
        crate::connect::Tunnel::Plain(mut stream) => {
            copy_bidirectional(&mut client_io, &mut stream).await?;
        }
        crate::connect::Tunnel::Tls(mut stream) => {
            copy_bidirectional(&mut client_io, &mut stream).await?;
        }
        crate::connect::Tunnel::Socks5(mut stream) => {
            copy_bidirectional(&mut client_io, &mut stream).await?;
        }
    }
    Ok(())
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response is always valid")
}
