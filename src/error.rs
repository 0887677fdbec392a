//! Error taxonomy (§7, C13).
//!
//! Each subsystem owns a small leaf error enum; [`CoreError`] wraps a leaf
//! under the matching §7 kind so that logging and client-visible responses
//! can match on `error_kind` without caring which subsystem raised it.
//! Call sites that only need to propagate use `anyhow::Result` the same way
//! the rest of the ambient stack does; call sites that must branch on the
//! kind use `CoreError` directly.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Transport-layer failures: connect, read/write, peer closed, timed out.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport broken: {0}")]
    Broken(String),
    #[error("operation timed out")]
    Timeout,
}

/// Malformed frame, unknown command, argument out of range.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size ({0} > {1})")]
    FrameTooLarge(usize, usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(String),
    #[error("command issued outside Ready state")]
    NotReady,
}

/// Unknown key, key/address mismatch under strict mode, untrusted peer.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("peer key is not trusted")]
    UntrustedPeer,
    #[error("protocol version advertisement was undefined")]
    UndefinedVersion,
}

/// Authenticated but not permitted for this resource.
#[derive(Debug, Error)]
#[error("access denied for {resource}")]
pub struct AccessError {
    pub resource: String,
}

/// Database broken, migration failed, invariant repair failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database is broken and has been moved aside")]
    DatabaseBroken,
    #[error("schema migration failed at step targeting version {target}: {detail}")]
    MigrationFailed { target: u64, detail: String },
    #[error("lastseen invariant repair failed: {0}")]
    RepairFailed(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Configuration referenced an undefined body.
#[derive(Debug, Error)]
#[error("policy error: {0}")]
pub struct PolicyError(pub String);

/// One variant per §7 error kind, each wrapping its leaf.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The §7 kind name, used as the structured `error_kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Transport(_) => "Transport",
            CoreError::Protocol(_) => "Protocol",
            CoreError::Trust(_) => "Trust",
            CoreError::Access(_) => "Access",
            CoreError::Storage(_) => "Storage",
            CoreError::Policy(_) => "Policy",
            CoreError::Internal(_) => "Internal",
        }
    }
}
