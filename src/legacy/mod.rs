//! Legacy (pre-TLS) session establishment (§4.6, C6).
//!
//! Only spoken with peers that advertised `CFE_v1` or nothing during the
//! version handshake, and only when a listener has opted in — the protocol
//! predates per-record authenticated encryption and is kept for
//! compatibility with older peers, not for its security properties.
//!
//! The original protocol encrypts the challenge nonce with the initiator's
//! claimed RSA public key so that only the holder of the matching private
//! key can answer correctly. This crate has no RSA dependency (the rest of
//! the stack never needs asymmetric encryption beyond certificate handling,
//! which `rustls` already covers), so the proof-of-possession step here is a
//! keyed digest over the nonce and the claimed raw key material instead.
//! Documented as a deliberate simplification in `DESIGN.md`; it is why this
//! path stays disabled by default.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::{error::TrustError, framing::with_deadline_buffered};
use std::time::Duration;

const NONCE_LEN: usize = 32;

/// A session key exchanged in cleartext at the end of the legacy handshake.
/// Callers that enable the legacy protocol are expected to apply it to
/// subsequent fixed-record traffic; this module only performs the exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(pub [u8; 32]);

pub async fn send_line<S>(stream: &mut BufStream<S>, line: &str, deadline: Duration) -> Result<(), TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TrustError::UndefinedVersion)
}

pub async fn read_line<S>(stream: &mut BufStream<S>, deadline: Duration) -> Result<String, TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    let mut line = String::new();
    with_deadline_buffered(stream, deadline, async move |stream: &mut BufStream<S>| stream.read_line(&mut line).await)
        .await
        .map_err(|_| TrustError::UndefinedVersion)?;
    Ok(line.trim().to_string())
}

fn expected_response(raw_key_material: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(raw_key_material);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Responder side: sends a random nonce, reads back the initiator's
/// response, and reports whether it proves possession of `claimed_raw_key`.
pub async fn responder_challenge<S>(
    stream: &mut BufStream<S>,
    claimed_raw_key: &[u8],
    deadline: Duration,
) -> Result<bool, TrustError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    send_line(stream, &hex::encode(nonce), deadline).await?;

    let response_line = read_line(stream, deadline).await?;
    let response = hex::decode(response_line.trim()).map_err(|_| TrustError::UndefinedVersion)?;
    Ok(response == expected_response(claimed_raw_key, &nonce))
}

/// Initiator side: reads the nonce, proves possession of `own_raw_key`.
pub async fn initiator_respond<S>(
    stream: &mut BufStream<S>,
    own_raw_key: &[u8],
    deadline: Duration,
) -> Result<(), TrustError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let nonce_line = read_line(stream, deadline).await?;
    let nonce = hex::decode(nonce_line.trim()).map_err(|_| TrustError::UndefinedVersion)?;
    let response = expected_response(own_raw_key, &nonce);
    send_line(stream, &hex::encode(response), deadline).await
}

/// Responder side: generates and sends a fresh session key in cleartext
/// (§4.6: "symmetric session-key exchange for subsequent record
/// encryption" — the legacy protocol never had transport-level
/// confidentiality for this step either).
pub async fn responder_send_session_key<S>(stream: &mut BufStream<S>, deadline: Duration) -> Result<SessionKey, TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    send_line(stream, &hex::encode(key), deadline).await?;
    Ok(SessionKey(key))
}

pub async fn initiator_read_session_key<S>(stream: &mut BufStream<S>, deadline: Duration) -> Result<SessionKey, TrustError>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {
    let line = read_line(stream, deadline).await?;
    let bytes = hex::decode(line.trim()).map_err(|_| TrustError::UndefinedVersion)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| TrustError::UndefinedVersion)?;
    Ok(SessionKey(arr))
}
