//! `cf-serverd` process entrypoint (§4.12, C12).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use cfnet_core::{
    cfg::{
        ConfigHandle,
        cli::{ExitCode, ParseOutcome, parse_args},
        logger::init_logger,
    },
    lastseen::LastseenIndex,
    server::{access::PolicyTree, listener::ConnectionPool},
    store::{self, Store},
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    reserve_standard_fds();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(ParseOutcome::Run(args)) => args,
        Ok(ParseOutcome::PrintAndExit(message)) => {
            println!("{message}");
            return exit_code(ExitCode::Ok);
        },
        Err(message) => {
            eprintln!("{message}");
            return exit_code(ExitCode::UsageError);
        },
    };

    let _logger_guard = match init_logger("logging.yaml") {
        Ok((guard, level_handle)) => {
            install_signal_handlers_for_logging(level_handle);
            Some(guard)
        },
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            None
        },
    };

    match run(args).await {
        Ok(()) => exit_code(ExitCode::Ok),
        Err(e) => {
            error!(error = %e, "startup failed");
            exit_code(ExitCode::StartupFailure)
        },
    }
}

async fn run(args: cfnet_core::cfg::cli::Args) -> Result<()> {
    let config = ConfigHandle::load(&args.config_path).context("loading configuration")?;
    let snapshot = config.current();

    let state_dir = std::path::PathBuf::from(&snapshot.paths.state_directory);
    if store::repair_trigger_present(&state_dir) {
        info!(path = %state_dir.display(), "repair trigger present at startup; proceeding with fresh open");
    }

    let store = Store::open(&state_dir).context("opening persistent store")?;
    store::migration::run(&store, &store::migration::startup_plan()).context("running startup schema migration")?;
    let lastseen = LastseenIndex::new(store);
    let repairs = lastseen.repair_invariants().context("repairing lastseen invariants")?;
    for action in &repairs {
        info!(?action, "lastseen invariant repaired at startup");
    }

    let policy = PolicyTree::default();
    let pool = Arc::new(ConnectionPool::new(config.clone(), lastseen, policy));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    install_signal_handlers(config, state_dir, shutdown_tx);

    pool.run(shutdown_rx).await.map_err(|e| anyhow::anyhow!("listener stopped: {e}"))
}

fn install_signal_handlers(config: ConfigHandle, state_dir: std::path::PathBuf, shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        let mut bus = signal(SignalKind::bus()).expect("install SIGBUS handler");

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received, shutting down");
                    let _ = shutdown_tx.send(true);
                    return;
                }
                _ = int.recv() => {
                    info!("SIGINT received, shutting down");
                    let _ = shutdown_tx.send(true);
                    return;
                }
                _ = hup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if let Err(e) = config.reload() {
                        error!(error = %e, "config reload failed, keeping previous configuration");
                    }
                }
                _ = bus.recv() => {
                    error!("SIGBUS received, marking repair trigger and exiting");
                    if let Err(e) = store::mark_repair_trigger(&state_dir) {
                        error!(error = %e, "failed to write repair trigger marker");
                    }
                    std::process::exit(ExitCode::RepairTriggered as i32);
                }
            }
        }
    });
}

fn install_signal_handlers_for_logging(level_handle: cfnet_core::cfg::logger::LevelHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut usr1 = signal(SignalKind::user_defined1()).expect("install SIGUSR1 handler");
        let mut usr2 = signal(SignalKind::user_defined2()).expect("install SIGUSR2 handler");
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    if let Err(e) = level_handle.more_verbose() {
                        error!(error = %e, "failed to raise log verbosity");
                    }
                }
                _ = usr2.recv() => {
                    if let Err(e) = level_handle.less_verbose() {
                        error!(error = %e, "failed to lower log verbosity");
                    }
                }
            }
        }
    });
}

fn exit_code(code: ExitCode) -> std::process::ExitCode {
    std::process::ExitCode::from(code as u8)
}

/// Opens `/dev/null` onto any of fd 0/1/2 that are closed at startup,
/// relying on the OS's lowest-available-fd allocation: opened before any
/// other file descriptor, the first three opens fill any gap among the
/// standard streams before spilling over to higher numbers (§4.12).
fn reserve_standard_fds() {
    use std::{fs::File, os::fd::AsRawFd};

    let mut keep = Vec::new();
    for _ in 0..3 {
        match File::open("/dev/null") {
            Ok(f) if (f.as_raw_fd() as i32) < 3 => keep.push(f),
            _ => break,
        }
    }
    for f in keep {
        std::mem::forget(f);
    }
}
