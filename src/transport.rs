//! Per-upstream outbound transport construction (§4.1, §9 architecture note).
//!
//! Given an [`Upstream`], build the client object the dispatcher uses to issue the request
//! *through* it.
//! `reqwest` covers http/https/socks5 upstreams directly via its proxy support; socks4/socks4a
//! upstreams have no home in `reqwest` (it has no stable custom-connector API), so those get a
//! hand-rolled `hyper` client dialed over a manually SOCKS4/4a-handshaked `TcpStream`.
//!
//! TLS verification is disabled on every outbound leg (§4.1 note): this is a forwarding proxy,
//! not a content gateway, and upstream proxies are frequently fronted by self-signed or
//! otherwise unverifiable certificates.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;

use crate::errors::CoreError;
use crate::model::{Scheme, Upstream};

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Always-accept certificate verifier: outbound TLS is used to reach upstream proxies whose
/// certificates this process has no reasonable way to validate.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Shared rustls client config that never verifies peer certificates, reused by the CONNECT
/// tunnel code and by the health checker in addition to the transport factory.
pub static INSECURE_TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
});

fn build_reqwest_proxy(upstream: &Upstream) -> anyhow::Result<reqwest::Proxy> {
    let mut url = format!("{}://{}", upstream.scheme, upstream.address);
    if let Some(username) = &upstream.username {
        let userinfo = match &upstream.password {
            Some(pass) if !pass.is_empty() => format!("{username}:{pass}@"),
            _ => format!("{username}@"),
        };
        url = format!("{}://{}{}", upstream.scheme, userinfo, upstream.address);
    }
    Ok(reqwest::Proxy::all(url)?)
}

/// A transport ready to issue one HTTP request through a given upstream.
pub enum Transport {
    /// http/https/socks5 upstream: `reqwest` handles proxying natively.
    Reqwest(reqwest::Client),
    /// socks4/socks4a upstream on the plain-HTTP path: hand-rolled hyper client dialed through
    /// a manual SOCKS4/4a handshake (§9 architecture note).
    Socks4Hyper { upstream: Arc<Upstream> },
}

pub struct TransportFactory;

impl TransportFactory {
    pub fn build(upstream: &Upstream, timeout: Duration) -> anyhow::Result<Transport> {
        match upstream.scheme {
            Scheme::Http | Scheme::Https | Scheme::Socks5 => {
                let proxy = build_reqwest_proxy(upstream)?;
                let client = reqwest::Client::builder()
                    .proxy(proxy)
                    .timeout(timeout)
                    .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                    .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                    .connect_timeout(TLS_HANDSHAKE_TIMEOUT)
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?;
                Ok(Transport::Reqwest(client))
            }
            Scheme::Socks4 | Scheme::Socks4a => Ok(Transport::Socks4Hyper {
                upstream: Arc::new(upstream.clone()),
            }),
        }
    }
}

/// Dial `upstream.address` and perform a SOCKS4/4a CONNECT handshake to `target_host:target_port`,
/// returning the raw stream ready for HTTP/1.1 traffic. Used both for the hand-rolled HTTP path
/// and for rejecting CONNECT tunnels through these schemes elsewhere (`connect.rs`).
pub async fn socks4_handshake(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, CoreError> {
    let mut stream = TcpStream::connect(&upstream.address)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("socks4 dial failed: {e}")))?;

    let mut request = Vec::with_capacity(32);
    request.push(0x04); // version
    request.push(0x01); // CONNECT
    request.extend_from_slice(&target_port.to_be_bytes());

    let is_socks4a = matches!(upstream.scheme, Scheme::Socks4a);
    if is_socks4a {
        request.extend_from_slice(&[0, 0, 0, 1]); // invalid IP triggers 4a hostname resolution
    } else {
        let ip: std::net::Ipv4Addr = target_host
            .parse()
            .map_err(|_| CoreError::UpstreamTransport(format!("socks4 requires a literal IPv4 target, got '{target_host}'")))?;
        request.extend_from_slice(&ip.octets());
    }

    if let Some(user) = &upstream.username {
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0x00);

    if is_socks4a {
        request.extend_from_slice(target_host.as_bytes());
        request.push(0x00);
    }

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(&request)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("socks4 handshake write failed: {e}")))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("socks4 handshake read failed: {e}")))?;

    if reply[1] != 0x5a {
        return Err(CoreError::UpstreamTransport(format!(
            "socks4 upstream rejected connection, code {}",
            reply[1]
        )));
    }

    Ok(stream)
}

/// Issue a single HTTP/1.1 request over a socks4/socks4a upstream using a throwaway hyper
/// client bound to one freshly dialed connection.
pub async fn socks4_request(
    upstream: &Upstream,
    req: hyper::Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, CoreError> {
    let host = req
        .uri()
        .host()
        .ok_or_else(|| CoreError::UpstreamTransport("request URI has no host".to_string()))?
        .to_string();
    let port = req.uri().port_u16().unwrap_or(80);

    let stream = socks4_handshake(upstream, &host, port).await?;
    let io = TokioIo::new(stream);

    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("hyper handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "socks4 upstream connection closed");
        }
    });

    tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(req))
        .await
        .map_err(|_| CoreError::UpstreamTransport("timed out waiting for response headers".to_string()))?
        .map_err(|e| CoreError::UpstreamTransport(format!("request failed: {e}")))
}
