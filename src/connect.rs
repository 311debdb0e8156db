//! CONNECT tunnel dispatch (§4.1 CONNECT handling).
//!
//! Unlike the plain HTTP path, a CONNECT tunnel hands the client a raw byte pipe once the
//! upstream accepts, so there is no per-attempt response to inspect beyond the initial
//! handshake. socks4/socks4a upstreams have no CONNECT-tunnel equivalent worth building (they
//! only know how to dial TCP, not relay an opaque tunnel) and are rejected outright so the
//! dispatcher can skip them without burning an `F` slot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fast_socks5::client::{Config as Socks5Config, Socks5Stream};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::CoreError;
use crate::model::{Scheme, Upstream};
use crate::selector::Selector;
use crate::store::Settings;
use crate::tracker::UsageTracker;
use crate::transport::INSECURE_TLS_CONFIG;

const CONNECT_RESPONSE_BUFFER: usize = 4096;

/// A tunnel ready for bidirectional splice with the client's own socket.
pub enum Tunnel {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    Socks5(Socks5Stream<TcpStream>),
}

pub struct ConnectDispatcher {
    selector: Arc<Selector>,
    tracker: Arc<UsageTracker>,
}

impl ConnectDispatcher {
    pub fn new(selector: Arc<Selector>, tracker: Arc<UsageTracker>) -> Self {
        Self { selector, tracker }
    }

    /// Attempt to establish a CONNECT tunnel to `target` through up to `F` upstreams, skipping
    /// (without consuming a slot) any socks4/socks4a upstream the selector happens to hand back.
    pub async fn dispatch(
        &self,
        target: &str,
        settings: &Settings,
    ) -> Result<(Tunnel, Arc<Upstream>), CoreError> {
        let fallback_slots = if settings.fallback {
            settings.fallback_max_retries.max(1)
        } else {
            1
        };
        // §5 CONNECT timeout floor: configured timeout_s below 60s is treated as 60s on this
        // path only; the plain HTTP dispatch path is not floored.
        let timeout = Duration::from_secs(settings.timeout_s.max(60));
        let mut last_error = CoreError::NoUpstreams;
        let mut slots_used = 0;
        let mut tried: HashSet<crate::model::UpstreamId> = HashSet::new();

        // Cap total selector draws generously above fallback_slots so that skipped
        // socks4/socks4a picks and already-tried re-picks don't starve legitimate attempts out
        // of the pool.
        let max_draws = fallback_slots.saturating_mul(4).max(fallback_slots + 8);

        for _draw in 0..max_draws {
            if slots_used >= fallback_slots {
                break;
            }
            let upstream = match self.selector.select() {
                Ok(u) => u,
                Err(err) => {
                    last_error = err;
                    break;
                }
            };

            if matches!(upstream.scheme, Scheme::Socks4 | Scheme::Socks4a) {
                debug!(upstream = %upstream.address, "skipping CONNECT through socks4/4a upstream");
                continue;
            }

            if !tried.insert(upstream.id) {
                debug!(upstream = %upstream.address, "already tried this upstream, redrawing without consuming a fallback slot");
                continue;
            }

            slots_used += 1;
            let start = Instant::now();
            match tokio::time::timeout(timeout, connect_through(&upstream, target)).await {
                Ok(Ok(tunnel)) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    self.tracker.record_request(
                        upstream.clone(),
                        "CONNECT".to_string(),
                        format!("CONNECT://{target}"),
                        200,
                        true,
                        elapsed_ms,
                        None,
                        settings.remove_unhealthy,
                    );
                    return Ok((tunnel, upstream));
                }
                Ok(Err(err)) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    self.tracker.record_request(
                        upstream.clone(),
                        "CONNECT".to_string(),
                        format!("CONNECT://{target}"),
                        0,
                        false,
                        elapsed_ms,
                        Some(err.to_string()),
                        settings.remove_unhealthy,
                    );
                    last_error = err;
                }
                Err(_) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    let err = CoreError::UpstreamTransport("CONNECT attempt timed out".to_string());
                    self.tracker.record_request(
                        upstream.clone(),
                        "CONNECT".to_string(),
                        format!("CONNECT://{target}"),
                        0,
                        false,
                        elapsed_ms,
                        Some(err.to_string()),
                        settings.remove_unhealthy,
                    );
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}

async fn connect_through(upstream: &Upstream, target: &str) -> Result<Tunnel, CoreError> {
    match upstream.scheme {
        Scheme::Socks5 => connect_via_socks5(upstream, target).await,
        Scheme::Http => connect_via_http(upstream, target, false).await,
        Scheme::Https => connect_via_http(upstream, target, true).await,
        Scheme::Socks4 | Scheme::Socks4a => {
            Err(CoreError::UnsupportedProtocol(upstream.scheme.as_str()))
        }
    }
}

async fn connect_via_socks5(upstream: &Upstream, target: &str) -> Result<Tunnel, CoreError> {
    let (host, port) = split_host_port(target)?;
    let config = Socks5Config::default();

    let stream = if let (Some(user), Some(pass)) = (&upstream.username, &upstream.password) {
        Socks5Stream::connect_with_password(
            &upstream.address,
            host,
            port,
            user.clone(),
            pass.clone(),
            config,
        )
        .await
    } else {
        Socks5Stream::connect(&upstream.address, host, port, config).await
    }
    .map_err(|e| CoreError::UpstreamTransport(format!("socks5 CONNECT failed: {e}")))?;

    Ok(Tunnel::Socks5(stream))
}

/// Literal HTTP/1.1 `CONNECT` handshake (§4.1): write the request line, optionally wrap the
/// socket in TLS first when the upstream itself is an https-scheme proxy, then read and parse
/// the status line out of up to 4KiB of response.
async fn connect_via_http(upstream: &Upstream, target: &str, wrap_tls: bool) -> Result<Tunnel, CoreError> {
    let raw = TcpStream::connect(&upstream.address)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("dial to upstream failed: {e}")))?;

    if wrap_tls {
        let connector = TlsConnector::from(INSECURE_TLS_CONFIG.clone());
        let server_name = rustls::pki_types::ServerName::try_from(host_only(&upstream.address).to_string())
            .map_err(|e| CoreError::UpstreamTransport(format!("invalid upstream server name: {e}")))?;
        let tls_stream = connector
            .connect(server_name, raw)
            .await
            .map_err(|e| CoreError::UpstreamTransport(format!("TLS handshake with upstream failed: {e}")))?;
        let tls_stream = issue_connect(tls_stream, upstream, target).await?;
        Ok(Tunnel::Tls(tls_stream))
    } else {
        let raw = issue_connect(raw, upstream, target).await?;
        Ok(Tunnel::Plain(raw))
    }
}

async fn issue_connect<S>(mut stream: S, upstream: &Upstream, target: &str) -> Result<S, CoreError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(user) = &upstream.username {
        let password = upstream.password.clone().unwrap_or_default();
        let credentials = BASE64.encode(format!("{user}:{password}").as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("failed to write CONNECT request: {e}")))?;

    let mut reader = BufReader::with_capacity(CONNECT_RESPONSE_BUFFER, &mut stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("failed to read CONNECT response: {e}")))?;

    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| CoreError::UpstreamTransport(format!("malformed CONNECT response line: '{status_line}'")))?;

    if status_code != 200 {
        return Err(CoreError::UpstreamTransport(format!(
            "upstream rejected CONNECT with status {status_code}"
        )));
    }

    // drain the remaining header lines up to the blank line terminator
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| CoreError::UpstreamTransport(format!("failed to read CONNECT headers: {e}")))?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(stream)
}

fn split_host_port(target: &str) -> Result<(&str, u16), CoreError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| CoreError::UpstreamTransport(format!("CONNECT target missing port: '{target}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CoreError::UpstreamTransport(format!("invalid port in CONNECT target: '{target}'")))?;
    Ok((host, port))
}

fn host_only(address: &str) -> &str {
    address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
}
