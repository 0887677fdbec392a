//! TLS session establishment and peer identity (§4.5, C5).
//!
//! Certificates are self-signed; trust is decided at the application layer
//! by key fingerprint against the [`crate::lastseen`] index, not by chain
//! validation, so both the client and server `rustls` configs install a
//! verifier that accepts any certificate the peer presents and defers the
//! actual trust decision to [`decide_trust`].

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod verify;

use std::{net::IpAddr, sync::Arc, time::Duration};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::{
    error::TrustError,
    framing::with_deadline_buffered,
    key::{DigestMethod, Key},
    lastseen::{LastseenIndex, Role},
};

/// Highest protocol version this build negotiates.
pub const CURRENT_PROTOCOL_VERSION: u32 = 2;

/// Maximum length of one handshake line (version greeting, username),
/// guarding against an unbounded read on a hostile or broken peer.
const MAX_LINE_LEN: usize = 256;

pub fn server_tls_acceptor(cert_chain: Vec<CertificateDer<'static>>, key: rustls::pki_types::PrivateKeyDer<'static>) -> Result<TlsAcceptor, rustls::Error> {
    let client_verifier = Arc::new(verify::AcceptAnyClientCert);
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Reads this host's own certificate chain and private key out of
/// `keyring_dir/host.crt` and `keyring_dir/host.key` (§4.5, §4.10
/// `KeyringDirectory`). Both files are PEM; the certificate file may
/// contain more than one certificate (leaf followed by any intermediates).
/// Each read takes a shared lock on the file for its duration, the way the
/// keyring coordinates with concurrent agent processes (§4.2) that might be
/// rewriting it.
pub fn load_server_identity(keyring_dir: &std::path::Path) -> std::io::Result<(Vec<CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)> {
    let cert_path = keyring_dir.join("host.crt");
    let key_path = keyring_dir.join("host.key");

    let cert_lock = crate::framing::lock::FileLock::shared_blocking(std::fs::File::open(&cert_path)?)?;
    let mut cert_reader = std::io::BufReader::new(cert_lock.file());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("no certificates found in {}", cert_path.display())));
    }
    drop(cert_lock);

    let key_lock = crate::framing::lock::FileLock::shared_blocking(std::fs::File::open(&key_path)?)?;
    let mut key_reader = std::io::BufReader::new(key_lock.file());
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("no private key found in {}", key_path.display())))?;

    Ok((certs, key))
}

pub fn client_tls_connector(cert_chain: Vec<CertificateDer<'static>>, key: rustls::pki_types::PrivateKeyDer<'static>) -> Result<TlsConnector, rustls::Error> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verify::AcceptAnyServerCert))
        .with_client_auth_cert(cert_chain, key)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Writes `"CFE_v<our_version>\n"`, reads the peer's greeting line, and
/// returns `min(ours, theirs)`. An unparseable or non-positive peer version
/// negotiates to `UNDEFINED` and the session is aborted (§4.5 step 1).
pub async fn negotiate_version<S>(
    stream: &mut BufStream<S>,
    our_version: u32,
    deadline: Duration,
) -> Result<u32, TrustError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| {
        stream.write_all(format!("CFE_v{our_version}\n").as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TrustError::UndefinedVersion)?;

    let mut line = String::new();
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| stream.read_line(&mut line).await)
        .await
        .map_err(|_| TrustError::UndefinedVersion)?;

    parse_greeting(&line).map(|theirs| theirs.min(our_version)).ok_or(TrustError::UndefinedVersion)
}

fn parse_greeting(line: &str) -> Option<u32> {
    let trimmed = line.trim();
    let digits = trimmed.strip_prefix("CFE_v")?;
    let version: i64 = digits.parse().ok()?;
    if version <= 0 {
        return None;
    }
    Some(version as u32)
}

/// Sends the initiator's identity line: a non-empty, printable username of
/// at most 64 bytes (§4.5 step 2).
pub async fn send_username<S>(stream: &mut BufStream<S>, username: &str, deadline: Duration) -> Result<(), TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    if username.is_empty() || username.len() > 64 || !username.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(TrustError::UndefinedVersion);
    }
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| {
        stream.write_all(username.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TrustError::UndefinedVersion)
}

pub async fn read_username<S>(stream: &mut BufStream<S>, deadline: Duration) -> Result<String, TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    let mut line = String::with_capacity(MAX_LINE_LEN);
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| stream.read_line(&mut line).await)
        .await
        .map_err(|_| TrustError::UndefinedVersion)?;
    let trimmed = line.trim().to_string();
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(TrustError::UndefinedVersion);
    }
    Ok(trimmed)
}

/// Outcome of [`decide_trust`] (§4.5 step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Known key, address matched the recorded one.
    Trusted,
    /// Known key at a new address; the lastseen record was updated.
    TrustedAddressUpdated,
    /// Previously unknown key, installed under `trust_keys_from`.
    TofuInstalled,
}

/// Extracts a [`Key`] from a peer's leaf certificate (self-signed; the
/// certificate chain beyond the leaf is never consulted).
pub fn key_from_certificate(cert: &CertificateDer<'_>, method: DigestMethod) -> Result<Key, crate::key::InvalidKey> {
    Key::construct(cert.as_ref().to_vec(), method)
}

/// Applies the trust decision in §4.5 step 3 / §4.6: an already-known key
/// at its recorded address is trusted outright; a known key at a new
/// address is trusted by key and the address is updated, unless `strict` is
/// set, in which case the address change is rejected; an unknown key is
/// installed (TOFU) only if `remote_address` matches one of `trust_rules`.
pub fn decide_trust(
    lastseen: &LastseenIndex,
    key: &Key,
    remote_address: IpAddr,
    role: Role,
    trust_rules: &[ipnet::IpNet],
    strict: bool,
    now_epoch: i64,
) -> Result<TrustOutcome, TrustError> {
    let fingerprint = key.fingerprint();
    let address_str = remote_address.to_string();
    let known = lastseen
        .lookup_by_fingerprint(fingerprint.as_bytes())
        .map_err(|_| TrustError::UntrustedPeer)?;

    // Seconds since this peer's last recorded contact in this role, fed
    // into the EWMA quality average (§4.4); `0.0` only on first contact,
    // where there is no prior record to measure from.
    let interval_since_last_contact = || -> f64 {
        match lastseen.quality(fingerprint.as_bytes(), role) {
            Ok(Some(record)) => (now_epoch - record.last_seen_epoch) as f64,
            _ => 0.0,
        }
    };

    match known {
        Some(recorded) if recorded == address_str.as_bytes() => {
            let interval = interval_since_last_contact();
            lastseen
                .record_contact(fingerprint.as_bytes(), address_str.as_bytes(), role, interval, now_epoch)
                .map_err(|_| TrustError::UntrustedPeer)?;
            Ok(TrustOutcome::Trusted)
        },
        Some(_) if strict => Err(TrustError::UntrustedPeer),
        Some(_) => {
            let interval = interval_since_last_contact();
            lastseen
                .record_contact(fingerprint.as_bytes(), address_str.as_bytes(), role, interval, now_epoch)
                .map_err(|_| TrustError::UntrustedPeer)?;
            Ok(TrustOutcome::TrustedAddressUpdated)
        },
        None => {
            if trust_rules.iter().any(|net| net.contains(&remote_address)) {
                lastseen
                    .record_contact(fingerprint.as_bytes(), address_str.as_bytes(), role, 0.0, now_epoch)
                    .map_err(|_| TrustError::UntrustedPeer)?;
                info!(fingerprint = %fingerprint, address = %address_str, "TOFU install");
                Ok(TrustOutcome::TofuInstalled)
            } else {
                Err(TrustError::UntrustedPeer)
            }
        },
    }
}

/// Sends the post-trust welcome banner.
pub async fn send_welcome<S>(stream: &mut BufStream<S>, banner: &str, deadline: Duration) -> Result<(), TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| {
        stream.write_all(banner.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TrustError::UndefinedVersion)
}
