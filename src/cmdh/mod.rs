//! Command handlers for the closed token set (§4.7, §1 out-of-scope
//! collaborators).
//!
//! `VAR`, `CONTEXT` and `QUERY` read from the policy evaluator's published
//! data, which this crate treats as an external collaborator (§1: "the
//! policy language parser/evaluator... call into the core through a small
//! set of contracts") — [`PolicyDataSource`] is that contract. `EXEC` runs
//! the resolved path directly with no shell involved, relying on the
//! access-control check already performed by [`crate::server::state::dispatch`]
//! to restrict which paths are runnable at all.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::{
    error::{CoreError, ProtocolError},
    wire::{self, CFD_TERMINATOR, Command},
};

/// Contract through which the policy evaluator publishes variable,
/// context, and query results. The core never interprets policy, so the
/// default implementation used when no evaluator is wired up reports
/// everything as unknown rather than guessing.
pub trait PolicyDataSource: Send + Sync {
    fn lookup_var(&self, name: &str) -> Option<String>;
    fn lookup_context(&self, name: &str) -> Option<bool>;
    fn run_query(&self, name: &str) -> Option<String>;
}

/// No policy evaluator wired up: every lookup reports unknown.
pub struct NoPolicyDataSource;
impl PolicyDataSource for NoPolicyDataSource {
    fn lookup_var(&self, _name: &str) -> Option<String> {
        None
    }
    fn lookup_context(&self, _name: &str) -> Option<bool> {
        None
    }
    fn run_query(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Executes `command` with `argument` and produces the bytes to frame back
/// to the client. `argument` has already passed access control by the time
/// it reaches here.
pub async fn execute(command: Command, argument: &str) -> Result<Vec<u8>, CoreError> {
    execute_with_source(command, argument, &NoPolicyDataSource).await
}

pub async fn execute_with_source(
    command: Command,
    argument: &str,
    policy_data: &dyn PolicyDataSource,
) -> Result<Vec<u8>, CoreError> {
    match command {
        Command::Version => Ok(version()),
        Command::Get => get_file(argument).await,
        Command::OpenDir => open_dir(argument).await,
        Command::Md5 => md5_digest(argument).await,
        Command::Synch => stat_summary(argument).await,
        Command::Exec => exec_bundle(argument).await,
        Command::Var => Ok(lookup_or_unknown(policy_data.lookup_var(argument))),
        Command::Context => Ok(lookup_or_unknown(policy_data.lookup_context(argument).map(|b| b.to_string()))),
        Command::Query => Ok(lookup_or_unknown(policy_data.run_query(argument))),
        Command::Scallback => Ok(b"SCALLBACK: registered".to_vec()),
    }
}

fn lookup_or_unknown(v: Option<String>) -> Vec<u8> {
    v.unwrap_or_else(|| "BAD: unknown".to_string()).into_bytes()
}

fn version() -> Vec<u8> {
    format!("OK: cf-serverd {}", env!("CARGO_PKG_VERSION")).into_bytes()
}

async fn get_file(path: &str) -> Result<Vec<u8>, CoreError> {
    let mut out = tokio::fs::read(path).await.map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(format!("GET {path}: {e}"))))?;
    out.extend_from_slice(CFD_TERMINATOR.as_bytes());
    Ok(out)
}

async fn open_dir(path: &str) -> Result<Vec<u8>, CoreError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(format!("OPENDIR {path}: {e}"))))?;
    let mut names = vec![".".to_string(), "..".to_string()];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(e.to_string())))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    let mut out = names.join("\0").into_bytes();
    if !out.is_empty() {
        out.push(0);
    }
    out.extend_from_slice(CFD_TERMINATOR.as_bytes());
    Ok(out)
}

/// Compares the peer's claimed digest (§4.7 MD5 row) against the server's
/// own digest of `argument`'s file, computed server-side. `argument` is
/// `"<claimed_digest> <path>"`; a malformed argument is a protocol error,
/// not a path lookup failure.
async fn md5_digest(argument: &str) -> Result<Vec<u8>, CoreError> {
    let (claimed_digest, path) = wire::split_md5_argument(argument)
        .ok_or_else(|| CoreError::Protocol(ProtocolError::Malformed(format!("MD5 {argument}"))))?;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(format!("MD5 {path}: {e}"))))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.map_err(|e| CoreError::Internal(e.to_string()))?;
    let actual = hex::encode(Md5::digest(&buf));
    if actual == claimed_digest {
        Ok(b"OK: match".to_vec())
    } else {
        Ok(b"BAD: mismatch".to_vec())
    }
}

async fn stat_summary(path: &str) -> Result<Vec<u8>, CoreError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(format!("SYNCH {path}: {e}"))))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!("OK: size={} mtime={mtime}", meta.len()).into_bytes())
}

async fn exec_bundle(path: &str) -> Result<Vec<u8>, CoreError> {
    let output = tokio::process::Command::new(path)
        .output()
        .await
        .map_err(|e| CoreError::Protocol(ProtocolError::ArgumentOutOfRange(format!("EXEC {path}: {e}"))))?;
    let mut out = output.stdout;
    out.extend_from_slice(&output.stderr);
    out.extend_from_slice(CFD_TERMINATOR.as_bytes());
    Ok(out)
}
