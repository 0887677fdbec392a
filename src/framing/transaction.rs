//! Transaction framing: `{ length: u32 network-byte-order, flag: u8 }`
//! followed by `length` bytes of body (§6 wire v2, §4.2). Used by both
//! protocol versions once the handshake completes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{big_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    error::{ProtocolError, TransportError},
    framing::{read_exact_retrying, with_deadline},
};

/// `length` field byte width + `flag` byte width.
pub const HEADER_LEN: usize = 5;

/// `more_flag` value for the last record in a reassembled message.
pub const FLAG_FINAL: u8 = 0x00;
/// `more_flag` value signalling that further frames continue this message.
pub const FLAG_MORE: u8 = 0x01;

/// Wire-exact transaction header, big-endian length, matching zerocopy's
/// idiom for BHS-style structs (`models/common.rs` in the teacher repo).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawHeader {
    length: U32,
    flag: u8,
}

/// One length-prefixed record as read off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub body: Vec<u8>,
    pub more: bool,
}

/// Writes a single transaction frame. Callers reassembling a larger logical
/// message across several frames set `more` on every frame but the last.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
    more: bool,
    deadline: Duration,
) -> Result<(), TransportError> {
    let header = RawHeader {
        length: U32::new(body.len() as u32),
        flag: if more { FLAG_MORE } else { FLAG_FINAL },
    };
    with_deadline(w, deadline, async move |w: &mut W| {
        w.write_all(header.as_bytes()).await?;
        w.write_all(body).await?;
        w.flush().await
    })
    .await
}

/// Reads a single transaction frame, enforcing `max_len` (§4.2: "records
/// above the maximum are truncated and flagged as a protocol error").
pub async fn read_frame<R: AsyncRead + AsyncWrite + Unpin>(
    r: &mut R,
    max_len: usize,
    deadline: Duration,
) -> Result<Frame, FrameError> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    with_deadline(r, deadline, async move |r: &mut R| read_exact_retrying(r, &mut hdr_buf).await)
        .await
        .map_err(FrameError::Transport)?;

    let hdr = RawHeader::read_from_bytes(&hdr_buf)
        .map_err(|_| FrameError::Protocol(ProtocolError::Malformed("short header".into())))?;
    let len = hdr.length.get() as usize;
    if len > max_len {
        return Err(FrameError::Protocol(ProtocolError::FrameTooLarge(len, max_len)));
    }

    let mut body = vec![0u8; len];
    if len > 0 {
        with_deadline(r, deadline, async move |r: &mut R| read_exact_retrying(r, &mut body).await)
            .await
            .map_err(FrameError::Transport)?;
    }

    Ok(Frame {
        body,
        more: hdr.flag == FLAG_MORE,
    })
}

/// Writes `body` as one or more transaction frames of at most `chunk_len`
/// bytes each, the counterpart [`read_message`] reassembles (§4.7 GET row:
/// "response is a sequence of transaction-framed chunks"). An empty body is
/// still one frame, so the peer always sees at least a final record.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
    chunk_len: usize,
    deadline: Duration,
) -> Result<(), TransportError> {
    debug_assert!(chunk_len > 0);
    if body.is_empty() {
        return write_frame(w, body, false, deadline).await;
    }
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_len).min(body.len());
        let more = end < body.len();
        write_frame(w, &body[offset..end], more, deadline).await?;
        offset = end;
    }
    Ok(())
}

/// Reassembles frames until the final (`more == false`) frame, concatenating
/// bodies in arrival order.
pub async fn read_message<R: AsyncRead + AsyncWrite + Unpin>(
    r: &mut R,
    max_total: usize,
    deadline: Duration,
) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    loop {
        let frame = read_frame(r, max_total.saturating_sub(out.len()), deadline).await?;
        out.extend_from_slice(&frame.body);
        if out.len() > max_total {
            return Err(FrameError::Protocol(ProtocolError::FrameTooLarge(
                out.len(),
                max_total,
            )));
        }
        if !frame.more {
            return Ok(out);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
