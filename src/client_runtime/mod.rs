//! Client runtime (§4.9, C9): connect, negotiate, and issue commands against
//! a single server endpoint.
//!
//! Retryability follows the same two-way split the teacher's own login
//! status codes use (`models/login/status.rs`: "mistake on initiator side;
//! do not retry" vs. "target temporarily cannot fulfil; may retry") —
//! [`CoreError::Transport`] and a `"BAD: busy"`-style response are transient,
//! everything else (access denied, unknown command, bad argument) is
//! permanent and is returned to the caller on the first attempt.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_rustls::client::TlsStream;
use tracing::{info, warn};

use crate::{
    error::{CoreError, ProtocolError, TransportError},
    framing::transaction::{FrameError, read_message, write_frame},
    key::{DigestMethod, Key},
    lastseen::{LastseenIndex, Role},
    tls,
};

/// Exponential backoff with a total wall-clock budget (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            total_budget: Duration::from_secs(60),
        }
    }
}

/// Per-endpoint trust configuration: whether to install an unknown key on
/// first contact (TOFU) rather than abort.
#[derive(Debug, Clone)]
pub struct EndpointTrust {
    pub tofu: bool,
    pub strict: bool,
    pub digest_method: DigestMethod,
}

/// Identity and transport material the runtime needs to dial a server.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub username: String,
}

/// File metadata as reported by `SYNCH`/`MD5` (§4.9 stat cache value type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub mtime_epoch: i64,
    pub digest_hex: Option<String>,
}

fn parse_stat_response(body: &str) -> Result<FileInfo, CoreError> {
    let rest = body
        .strip_prefix("OK: ")
        .ok_or_else(|| CoreError::Protocol(ProtocolError::Malformed(body.to_string())))?;
    let mut size = None;
    let mut mtime = None;
    for field in rest.split_whitespace() {
        if let Some(v) = field.strip_prefix("size=") {
            size = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("mtime=") {
            mtime = v.parse().ok();
        }
    }
    match (size, mtime) {
        (Some(size), Some(mtime_epoch)) => Ok(FileInfo { size, mtime_epoch, digest_hex: None }),
        _ => Err(CoreError::Protocol(ProtocolError::Malformed(body.to_string()))),
    }
}

/// One negotiated connection to a single server, plus the memoised stat
/// cache for it (§4.9: "memoises `(remote_path, server) → FileInfo` for the
/// runtime's lifetime, explicit invalidation, no TTL").
pub struct Client {
    server: String,
    stream: Mutex<TlsStream<TcpStream>>,
    retry: RetryPolicy,
    stat_cache: Mutex<HashMap<String, FileInfo>>,
}

impl Client {
    /// Resolves `endpoint` (`"<host>[:<port>]"`, default port 5308), dials
    /// TCP, runs the TLS handshake, negotiates the protocol version, and
    /// applies the §4.5/§4.6 trust decision. Returns before issuing any
    /// command.
    pub async fn connect(
        endpoint: &str,
        identity: &ClientIdentity,
        lastseen: Arc<LastseenIndex>,
        trust: &EndpointTrust,
        retry: RetryPolicy,
    ) -> Result<Self, CoreError> {
        let addr = resolve_endpoint(endpoint)?;
        let tcp = TcpStream::connect(addr).await.map_err(|e| CoreError::Transport(TransportError::ConnectFailed(e.to_string())))?;

        let connector = tls::client_tls_connector(identity.cert_chain.clone(), identity.private_key.clone_key())
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let server_name = rustls::pki_types::ServerName::IpAddress(addr.ip().into());
        let mut stream = connector.connect(server_name, tcp).await.map_err(|e| CoreError::Transport(TransportError::ConnectFailed(e.to_string())))?;

        let peer_cert = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first().cloned())
            .ok_or_else(|| CoreError::Trust(crate::error::TrustError::UntrustedPeer))?;
        let key = tls::key_from_certificate(&peer_cert, trust.digest_method).map_err(|e| CoreError::Internal(e.to_string()))?;

        let now_epoch = chrono::Utc::now().timestamp();
        let trust_rules: Vec<ipnet::IpNet> = if trust.tofu { vec![any_net(addr.ip())] } else { Vec::new() };
        let _ = tls::decide_trust(&lastseen, &key, addr.ip(), Role::Outbound, &trust_rules, trust.strict, now_epoch)?;
        info!(server = endpoint, fingerprint = key.fingerprint(), "connected");

        Ok(Self {
            server: endpoint.to_string(),
            stream: Mutex::new(stream),
            retry,
            stat_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn request(&self, line: &str) -> Result<Vec<u8>, CoreError> {
        let deadline = Duration::from_secs(30);
        let mut attempt = 0u32;
        let mut delay = self.retry.initial_delay;
        let started = std::time::Instant::now();

        loop {
            let outcome = self.request_once(line, deadline).await;
            match outcome {
                Ok(body) => return Ok(body),
                Err(e) if is_transient(&e) && started.elapsed() < self.retry.total_budget => {
                    attempt += 1;
                    warn!(server = %self.server, %attempt, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                    continue;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(&self, line: &str, deadline: Duration) -> Result<Vec<u8>, CoreError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, line.as_bytes(), false, deadline).await.map_err(CoreError::Transport)?;
        let body = read_message(&mut *stream, 1 << 20, deadline).await.map_err(|e| match e {
            FrameError::Transport(t) => CoreError::Transport(t),
            FrameError::Protocol(p) => CoreError::Protocol(p),
        })?;
        if body.starts_with(b"BAD: access denied") || body.starts_with(b"BAD: unknown") {
            return Err(CoreError::Protocol(ProtocolError::Malformed(String::from_utf8_lossy(&body).into_owned())));
        }
        Ok(body)
    }

    pub async fn get_file(&self, remote_path: &str) -> Result<Vec<u8>, CoreError> {
        let body = self.request(&format!("GET {remote_path}")).await?;
        Ok(strip_terminator(body))
    }

    pub async fn open_dir(&self, remote_path: &str) -> Result<Vec<String>, CoreError> {
        let body = self.request(&format!("OPENDIR {remote_path}")).await?;
        let text = String::from_utf8_lossy(&body);
        let listing = text.strip_suffix(crate::wire::CFD_TERMINATOR).unwrap_or(&text);
        Ok(listing.split('\0').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    /// Reads `SYNCH` for `remote_path`, caching the result keyed by
    /// `(remote_path, server)`. A prior cached entry is returned without a
    /// round trip unless [`Client::invalidate_stat`] was called for it.
    pub async fn stat(&self, remote_path: &str) -> Result<FileInfo, CoreError> {
        let cache_key = remote_path.to_string();
        if let Some(info) = self.stat_cache.lock().await.get(&cache_key) {
            return Ok(info.clone());
        }
        let body = self.request(&format!("SYNCH {remote_path}")).await?;
        let info = parse_stat_response(&String::from_utf8_lossy(&body))?;
        self.stat_cache.lock().await.insert(cache_key, info.clone());
        Ok(info)
    }

    /// Drops any cached [`FileInfo`] for `remote_path` so the next
    /// [`Client::stat`] call performs a fresh round trip.
    pub async fn invalidate_stat(&self, remote_path: &str) {
        self.stat_cache.lock().await.remove(remote_path);
    }

    /// Asks the server to compare `expected_hex` against its own digest of
    /// `remote_path` (§4.7 MD5 row): the comparison happens server-side, this
    /// only interprets the `OK`/`BAD` verdict.
    pub async fn compare_digest(&self, remote_path: &str, expected_hex: &str) -> Result<bool, CoreError> {
        let body = self.request(&format!("MD5 {expected_hex} {remote_path}")).await?;
        Ok(body.starts_with(b"OK:"))
    }

    pub async fn exec_bundle(&self, remote_path: &str) -> Result<Vec<u8>, CoreError> {
        let body = self.request(&format!("EXEC {remote_path}")).await?;
        Ok(strip_terminator(body))
    }

    pub async fn query(&self, name: &str) -> Result<String, CoreError> {
        let body = self.request(&format!("QUERY {name}")).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Strips the trailing `CFD_TERMINATOR` marker the server appends to `GET`
/// and `EXEC` responses, mirroring the stripping `open_dir` already does for
/// `OPENDIR` listings.
fn strip_terminator(mut body: Vec<u8>) -> Vec<u8> {
    let terminator = crate::wire::CFD_TERMINATOR.as_bytes();
    if body.ends_with(terminator) {
        body.truncate(body.len() - terminator.len());
    }
    body
}

/// A CIDR covering `addr`'s whole address family, used when `EndpointTrust::tofu`
/// allows installing an unknown key regardless of where it connects from.
fn any_net(addr: IpAddr) -> ipnet::IpNet {
    match addr {
        IpAddr::V4(_) => ipnet::IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is valid")),
        IpAddr::V6(_) => ipnet::IpNet::V6(ipnet::Ipv6Net::new(std::net::Ipv6Addr::UNSPECIFIED, 0).expect("::/0 is valid")),
    }
}

fn is_transient(err: &CoreError) -> bool {
    matches!(err, CoreError::Transport(_))
}

fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, CoreError> {
    const DEFAULT_PORT: u16 = 5308;
    let candidate = if endpoint.contains(':') { endpoint.to_string() } else { format!("{endpoint}:{DEFAULT_PORT}") };
    candidate
        .to_socket_addrs()
        .map_err(|e| CoreError::Transport(TransportError::ConnectFailed(e.to_string())))?
        .next()
        .ok_or_else(|| CoreError::Transport(TransportError::ConnectFailed(format!("could not resolve {endpoint}"))))
}
