//! Server-side connection state and command dispatch (§4.7).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{
    cmdh,
    error::{CoreError, ProtocolError},
    server::access::{AccessSet, PolicyTree},
    wire::{self, Command},
};

/// Output of the TLS or legacy handshake, handed to the server dispatcher
/// (§3 Connection Info).
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub negotiated_version: u32,
    pub remote_key_fingerprint: String,
    pub remote_address: std::net::IpAddr,
    pub username: String,
}

/// Connection lifecycle phase (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    PreHandshake,
    Handshaking,
    Authenticated,
    Ready,
    Serving,
    Terminating,
}

/// Per-connection server state (§3 Server Connection State).
pub struct ServerConnectionState {
    pub info: ConnectionInfo,
    pub authenticated: bool,
    pub encrypted: bool,
    pub granted_access: AccessSet,
    pub phase: ConnPhase,
    pub idle_timeout: Duration,
    pub last_activity: Instant,
}

impl ServerConnectionState {
    /// `granted_access` is derived once from `info` against `policy`
    /// (§4.7: "path must be whitelisted for this peer's
    /// fingerprint/address/hostname") and cached for the life of the
    /// connection; each request still re-checks the resource named by its
    /// argument in [`dispatch`].
    pub fn new(info: ConnectionInfo, encrypted: bool, idle_timeout: Duration, policy: &PolicyTree) -> Self {
        let granted_access = policy.access_for_peer(&info);
        Self {
            info,
            authenticated: true,
            encrypted,
            granted_access,
            phase: ConnPhase::Authenticated,
            idle_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle_expired(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_timeout
    }

    pub fn enter_ready(&mut self) {
        self.phase = ConnPhase::Ready;
    }
}

/// One dispatch outcome: the response bytes to frame back to the client,
/// and the connection's next phase.
pub struct DispatchOutcome {
    pub response: Vec<u8>,
    pub next_phase: ConnPhase,
}

/// Validates syntax, applies access control, executes, and produces the
/// response for one request line (§4.7). Non-`Ready` dispatch is rejected
/// as a protocol violation by the caller before this is ever invoked.
pub async fn dispatch(
    state: &mut ServerConnectionState,
    policy: &PolicyTree,
    line: &str,
) -> Result<DispatchOutcome, CoreError> {
    if state.phase != ConnPhase::Ready {
        return Err(CoreError::Protocol(ProtocolError::NotReady));
    }
    state.phase = ConnPhase::Serving;
    state.touch();

    let (command, argument) = match wire::parse_request_line(line) {
        Ok(v) => v,
        Err(e) => return Err(CoreError::Protocol(ProtocolError::UnknownCommand(e.0))),
    };

    let required = required_capability(command);
    if !required.is_empty() {
        let granted = resource_access(command, argument, policy, &state.info);
        if !state.granted_access.contains(required) || !granted.contains(required) {
            warn!(command = %command, remote_ip = %state.info.remote_address, "access denied");
            return Ok(DispatchOutcome {
                response: b"BAD: access denied".to_vec(),
                next_phase: ConnPhase::Ready,
            });
        }
    }

    let response = cmdh::execute(command, argument).await?;
    info!(command = %command, remote_ip = %state.info.remote_address, "command served");

    Ok(DispatchOutcome {
        response,
        next_phase: ConnPhase::Ready,
    })
}

/// The capability a command needs before it runs at all, independent of
/// policy: fixed by what the command does, not by what any rule grants.
/// `VERSION`/`SCALLBACK` need none and are always served.
fn required_capability(command: Command) -> AccessSet {
    match command {
        Command::Get | Command::OpenDir | Command::Md5 | Command::Synch | Command::Var | Command::Context | Command::Query => {
            AccessSet::READ
        },
        Command::Exec => AccessSet::EXEC,
        Command::Version | Command::Scallback => AccessSet::empty(),
    }
}

/// The access policy grants for the specific resource `argument` names,
/// scoped to the connecting peer.
fn resource_access(command: Command, argument: &str, policy: &PolicyTree, info: &ConnectionInfo) -> AccessSet {
    match command {
        Command::Get | Command::OpenDir | Command::Synch | Command::Exec => policy.access_for_path(argument, info),
        Command::Md5 => {
            let path = wire::split_md5_argument(argument).map(|(_, path)| path).unwrap_or(argument);
            policy.access_for_path(path, info)
        },
        Command::Var | Command::Context | Command::Query => policy.access_for_identifier(argument, info),
        Command::Version | Command::Scallback => AccessSet::empty(),
    }
}
