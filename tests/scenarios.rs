//! Scenario-level integration tests: each spins up one or more fake upstreams on real sockets
//! and exercises the library's components directly rather than a compiled binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rotaprox::config::{AppConfig, RotationMethod};
use rotaprox::connect::ConnectDispatcher;
use rotaprox::dispatcher::{Dispatcher, OutboundRequest};
use rotaprox::middleware::{AuthGate, RateLimiter};
use rotaprox::model::{Scheme, Upstream, UpstreamId, UpstreamStatus};
use rotaprox::selector::Selector;
use rotaprox::store::{MemoryStore, Settings, Store};
use rotaprox::tracker::UsageTracker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn base_settings() -> Settings {
    let config = AppConfig::from_toml_str(
        r#"
[server]
listen = ["127.0.0.1:8080"]

[[upstream]]
address = "127.0.0.1:9001"
"#,
    )
    .unwrap();
    Settings::from_config(&config)
}

async fn spawn_http_upstream(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    addr
}

/// Binds then immediately drops the listener so the port refuses connections, simulating an
/// upstream that is down.
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn dispatcher_for(selector: Arc<Selector>) -> (Dispatcher, Arc<dyn Store>) {
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
    (Dispatcher::new(selector, tracker), store)
}

#[tokio::test]
async fn scenario_1_random_single_upstream_success() {
    let addr = spawn_http_upstream(
        "HTTP/1.1 200 OK\r\nX-From: a\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;

    let upstream = Arc::new(Upstream::new(UpstreamId(1), addr.to_string(), Scheme::Http));
    let selector = Arc::new(Selector::new(RotationMethod::Random, 60));
    let mut settings = base_settings();
    settings.rotation_method = RotationMethod::Random;
    settings.retries = 1;
    settings.fallback = false;
    selector.refresh(&[upstream.clone()], &settings);

    let (dispatcher, _store) = dispatcher_for(selector);
    let request = OutboundRequest {
        method: http::Method::GET,
        uri: "http://target/".parse().unwrap(),
        headers: http::HeaderMap::new(),
        body: bytes::Bytes::new(),
    };

    let outcome = dispatcher.dispatch(request, &settings).await.unwrap();
    assert_eq!(outcome.response.status(), 200);
    assert_eq!(
        outcome.response.headers().get("x-from").unwrap(),
        "a"
    );

    let snap = upstream.stats.snapshot();
    assert_eq!(snap.requests, 1);
    assert_eq!(snap.successful_requests, 1);
    assert_eq!(snap.status, UpstreamStatus::Active);
}

#[tokio::test]
async fn scenario_2_all_fail_cascade() {
    let dead_a = dead_address().await;
    let dead_b = dead_address().await;

    let a = Arc::new(Upstream::new(UpstreamId(1), dead_a.to_string(), Scheme::Http));
    let b = Arc::new(Upstream::new(UpstreamId(2), dead_b.to_string(), Scheme::Http));

    let selector = Arc::new(Selector::new(RotationMethod::RoundRobin, 60));
    let mut settings = base_settings();
    settings.rotation_method = RotationMethod::RoundRobin;
    settings.retries = 2;
    settings.fallback = true;
    settings.fallback_max_retries = 5;
    selector.refresh(&[a.clone(), b.clone()], &settings);

    let (dispatcher, _store) = dispatcher_for(selector);
    let request = OutboundRequest {
        method: http::Method::GET,
        uri: "http://target/".parse().unwrap(),
        headers: http::HeaderMap::new(),
        body: bytes::Bytes::new(),
    };

    let err = dispatcher.dispatch(request, &settings).await.unwrap_err();
    assert!(err.is_retryable_upstream_error() || matches!(err, rotaprox::errors::CoreError::NoUpstreams));

    // With a 2-upstream pool and fallback_max_retries=5, each distinct upstream is drawn
    // exactly once (re-picks of an already-tried upstream don't consume an F slot) and retried
    // twice, so each recorded exactly 2 failures — one short of the 3-failure threshold that
    // would flip status to failed.
    assert_eq!(a.stats.status(), UpstreamStatus::Idle);
    assert_eq!(b.stats.status(), UpstreamStatus::Idle);
    assert_eq!(a.stats.snapshot().consecutive_failures, 2);
    assert_eq!(b.stats.snapshot().consecutive_failures, 2);
}

#[tokio::test]
async fn scenario_3_fallback_succeeds_on_second_upstream() {
    let dead_a = dead_address().await;
    let addr_b = spawn_http_upstream(
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;

    let a = Arc::new(Upstream::new(UpstreamId(1), dead_a.to_string(), Scheme::Http));
    let b = Arc::new(Upstream::new(UpstreamId(2), addr_b.to_string(), Scheme::Http));

    let selector = Arc::new(Selector::new(RotationMethod::RoundRobin, 60));
    let mut settings = base_settings();
    settings.rotation_method = RotationMethod::RoundRobin;
    settings.retries = 1;
    settings.fallback = true;
    settings.fallback_max_retries = 3;
    selector.refresh(&[a.clone(), b.clone()], &settings);

    let (dispatcher, _store) = dispatcher_for(selector);
    let request = OutboundRequest {
        method: http::Method::GET,
        uri: "http://target/".parse().unwrap(),
        headers: http::HeaderMap::new(),
        body: bytes::Bytes::new(),
    };

    let outcome = dispatcher.dispatch(request, &settings).await.unwrap();
    assert_eq!(outcome.response.status(), 200);
    assert_eq!(outcome.upstream.id, b.id);

    assert!(a.stats.snapshot().consecutive_failures >= 1);
    assert_eq!(b.stats.snapshot().successful_requests, 1);
    assert_eq!(b.stats.status(), UpstreamStatus::Active);
}

#[tokio::test]
async fn scenario_4_connect_tunnel_through_http_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let mut total_read = 0;
            loop {
                let n = stream.read(&mut buf[total_read..]).await.unwrap();
                total_read += n;
                if buf[..total_read].windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

            // echo whatever the client sends through the tunnel afterward
            let mut echo_buf = [0u8; 1024];
            if let Ok(n) = stream.read(&mut echo_buf).await {
                let _ = stream.write_all(&echo_buf[..n]).await;
            }
        }
    });

    let upstream = Arc::new(Upstream::new(UpstreamId(1), addr.to_string(), Scheme::Http));
    let selector = Arc::new(Selector::new(RotationMethod::Random, 60));
    let mut settings = base_settings();
    settings.fallback = false;
    selector.refresh(&[upstream.clone()], &settings);

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
    let tracker = Arc::new(UsageTracker::new(store));
    let connect_dispatcher = ConnectDispatcher::new(selector, tracker);

    let (tunnel, chosen) = connect_dispatcher
        .dispatch("example.com:443", &settings)
        .await
        .unwrap();
    assert_eq!(chosen.id, upstream.id);

    match tunnel {
        rotaprox::connect::Tunnel::Plain(mut stream) => {
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
        }
        _ => panic!("expected a plain tunnel for an http-scheme upstream"),
    }
}

#[tokio::test]
async fn scenario_5_inbound_auth_gate() {
    let mut headers_missing = http::HeaderMap::new();
    let err = AuthGate::check(&mut headers_missing, "u", "p").unwrap_err();
    assert!(matches!(err, rotaprox::errors::CoreError::AuthRequired));

    let creds = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        b"u:p",
    );
    let mut headers_ok = http::HeaderMap::new();
    headers_ok.insert(
        "proxy-authorization",
        format!("Basic {creds}").parse().unwrap(),
    );
    AuthGate::check(&mut headers_ok, "u", "p").unwrap();
    assert!(!headers_ok.contains_key("proxy-authorization"));
}

#[tokio::test]
async fn scenario_6_rate_limit_admits_then_blocks() {
    let limiter = RateLimiter::new();
    let ip: std::net::IpAddr = "10.0.0.1".parse().unwrap();

    let results: Vec<bool> = (0..3).map(|_| limiter.check(ip, 1, 2).is_ok()).collect();
    assert_eq!(results, vec![true, true, false]);
}
