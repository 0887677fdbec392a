//! Framed I/O (§4.2, C2).
//!
//! Two framings coexist on the wire: [`transaction`]'s length+flag header
//! used by both protocol versions past the handshake, and
//! [`fixed_record`]'s exactly-`CF_BUFSIZE` records used only by the legacy
//! protocol. [`lock`] provides the scoped file locks C3 and the keyring use
//! to coordinate with concurrent agent processes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod fixed_record;
pub mod lock;
pub mod transaction;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use crate::error::TransportError;

/// Runs `fut`, racing it against `deadline`. On expiry, half-closes `sock`
/// in both directions (per §4.2: "on expiry the socket is shut down in both
/// directions before returning `Timeout`") and returns [`TransportError::Timeout`].
pub(crate) async fn with_deadline<S, F, T>(
    sock: &mut S,
    deadline: Duration,
    op: F,
) -> Result<T, TransportError>
where
    S: AsyncWrite + Unpin,
    F: AsyncFnOnce(&mut S) -> std::io::Result<T>,
{
    let timed = tokio::time::timeout(deadline, op(sock));
    match timed.await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(_)) => Err(TransportError::Broken("io error".to_string())),
        Err(_) => {
            let _ = sock.shutdown().await;
            Err(TransportError::Timeout)
        },
    }
}

/// Like [`with_deadline`], but for a [`BufStream`] where the timeout shutdown
/// must hit the raw inner stream (bypassing the write buffer) rather than
/// attempt to flush it.
pub(crate) async fn with_deadline_buffered<S, F, T>(
    stream: &mut BufStream<S>,
    deadline: Duration,
    op: F,
) -> Result<T, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: AsyncFnOnce(&mut BufStream<S>) -> std::io::Result<T>,
{
    let timed = tokio::time::timeout(deadline, op(stream));
    match timed.await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(_)) => Err(TransportError::Broken("io error".to_string())),
        Err(_) => {
            let _ = stream.get_mut().shutdown().await;
            Err(TransportError::Timeout)
        },
    }
}

/// Retries a blocking-style read on `EINTR`, matching §4.2's "receivers retry
/// on signal interruption".
pub(crate) async fn read_exact_retrying<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> std::io::Result<()> {
    use tokio::io::AsyncReadExt;
    loop {
        match r.read_exact(buf).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
