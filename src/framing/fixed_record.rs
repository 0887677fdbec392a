//! Fixed-record framing for the legacy (pre-TLS) protocol (§4.2, §6 wire v1).
//!
//! A request fills a buffer of exactly [`CF_BUFSIZE`] bytes; the peer reads
//! until it has that many bytes or the connection closes. A read timeout
//! half-closes the socket so delayed bytes are never reinterpreted as the
//! start of a later request.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{error::TransportError, framing::with_deadline};

/// Size of one legacy cleartext record, matching the historical CFEngine
/// wire constant.
pub const CF_BUFSIZE: usize = 4096;

/// Reads exactly one [`CF_BUFSIZE`]-byte record. A short read before EOF is
/// reported as [`TransportError::PeerClosed`]; a timeout half-closes the
/// socket and is reported as [`TransportError::Timeout`].
pub async fn read_record<R: AsyncRead + AsyncWrite + Unpin>(
    r: &mut R,
    deadline: Duration,
) -> Result<[u8; CF_BUFSIZE], TransportError> {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; CF_BUFSIZE];
    let mut filled = 0usize;
    while filled < CF_BUFSIZE {
        let n = with_deadline(r, deadline, async move |r: &mut R| r.read(&mut buf[filled..]).await).await?;
        if n == 0 {
            return Err(TransportError::PeerClosed);
        }
        filled += n;
    }
    Ok(buf)
}

/// Writes a record, zero-padding it to exactly [`CF_BUFSIZE`] bytes.
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
    deadline: Duration,
) -> Result<(), TransportError> {
    if body.len() > CF_BUFSIZE {
        return Err(TransportError::Broken(format!(
            "record body {} exceeds CF_BUFSIZE {CF_BUFSIZE}",
            body.len()
        )));
    }
    let mut buf = [0u8; CF_BUFSIZE];
    buf[..body.len()].copy_from_slice(body);
    with_deadline(w, deadline, async move |w: &mut W| {
        w.write_all(&buf).await?;
        w.flush().await
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn round_trip_exact_record() {
        let (mut a, mut b) = duplex(CF_BUFSIZE * 2);
        let mut body = vec![0u8; 16];
        body.copy_from_slice(b"hello-legacy-1234".get(..16).expect("len"));
        write_record(&mut a, &body, Duration::from_secs(1))
            .await
            .expect("write");
        let rec = read_record(&mut b, Duration::from_secs(1))
            .await
            .expect("read");
        assert_eq!(&rec[..16], body.as_slice());
        assert!(rec[16..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn short_read_before_close_is_peer_closed() {
        let (a, mut b) = duplex(64);
        drop(a);
        let err = read_record(&mut b, Duration::from_secs(1))
            .await
            .expect_err("peer closed");
        assert!(matches!(err, TransportError::PeerClosed));
    }
}
