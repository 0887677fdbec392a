//! Handshake literals and the closed command-token set (§4.7).
//!
//! Mirrors the teacher's `models/opcode.rs` idiom: a plain enum for the
//! typed value, a fallible parse from the wire representation, and a
//! dedicated error type rather than folding parse failure into a generic
//! string.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Prefix of the version-handshake greeting line (§4.5 step 1).
pub const VERSION_GREETING_PREFIX: &str = "CFE_v";

/// Terminator appended after the last entry of an `OPENDIR` listing (§8
/// scenario 5): entries are NUL-separated, the listing itself ends with
/// this marker so the reader can distinguish "more frames coming" from
/// "directory exhausted" without relying on frame boundaries alone.
pub const CFD_TERMINATOR: &str = "CFD_TERMINATOR";

/// The closed set of command tokens the server dispatches (§4.7). No other
/// token is ever accepted; an unrecognized token is `ProtocolError::UnknownCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Exec,
    Get,
    OpenDir,
    Synch,
    Md5,
    Version,
    Var,
    Context,
    Query,
    Scallback,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Exec,
        Command::Get,
        Command::OpenDir,
        Command::Synch,
        Command::Md5,
        Command::Version,
        Command::Var,
        Command::Context,
        Command::Query,
        Command::Scallback,
    ];

    pub const fn token(self) -> &'static str {
        match self {
            Command::Exec => "EXEC",
            Command::Get => "GET",
            Command::OpenDir => "OPENDIR",
            Command::Synch => "SYNCH",
            Command::Md5 => "MD5",
            Command::Version => "VERSION",
            Command::Var => "VAR",
            Command::Context => "CONTEXT",
            Command::Query => "QUERY",
            Command::Scallback => "SCALLBACK",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Returned when the command word does not match one of [`Command::ALL`].
#[derive(Debug, Error)]
#[error("unknown command token: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.token() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Splits one request line into a command token and the remainder of the
/// line (trimmed), the way the server reads a dispatched request off a
/// transaction frame's body.
pub fn parse_request_line(line: &str) -> Result<(Command, &str), UnknownCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let command = word.parse()?;
    Ok((command, rest.trim()))
}

/// Splits an `MD5` argument of the form `"<claimed_digest> <path>"` into its
/// two halves (§4.7 MD5 row: "compare the peer's claimed digest of a file
/// with the server's current digest"). Returns `None` when the argument has
/// no separating space.
pub fn split_md5_argument(argument: &str) -> Option<(&str, &str)> {
    argument.split_once(' ').map(|(digest, path)| (digest, path.trim()))
}
