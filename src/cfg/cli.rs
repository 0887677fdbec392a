// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().context("cannot get current working dir")?.join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Process exit codes (C12). `cf-serverd` never panics its way out; every
/// exit path goes through one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Clean shutdown (`TERM`/`INT` after drain, or `--help`/`--version`).
    Ok = 0,
    /// Startup failure: bad config, unreadable keyring, unbindable address.
    StartupFailure = 1,
    /// A fatal storage signal was handled; the repair trigger was set and
    /// the process exited without attempting further cleanup (§4.3, §4.8).
    RepairTriggered = 101,
    /// Argument parsing failure.
    UsageError = 255,
}

/// Parsed command line (§4.11, C12). Mirrors the flag set CFEngine's
/// `cf-serverd` accepts: a config path override, a foreground/no-fork
/// toggle, and verbosity knobs.
#[derive(Debug, Clone)]
pub struct Args {
    pub config_path: String,
    pub no_fork: bool,
    pub inform: bool,
    pub verbose: bool,
    pub debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_path: "cf-serverd.yaml".to_string(),
            no_fork: false,
            inform: false,
            verbose: false,
            debug: false,
        }
    }
}

pub enum ParseOutcome {
    Run(Args),
    /// `--help` or `--version` was given; print `message` and exit 0.
    PrintAndExit(String),
}

/// Parses `argv` (excluding `argv[0]`). Unknown flags or a flag missing its
/// required value are reported as [`ExitCode::UsageError`].
pub fn parse_args<I: IntoIterator<Item = String>>(argv: I) -> Result<ParseOutcome, String> {
    let mut args = Args::default();
    let mut it = argv.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(ParseOutcome::PrintAndExit(help_text())),
            "--version" | "-V" => return Ok(ParseOutcome::PrintAndExit(version_text())),
            "--no-fork" | "-F" => args.no_fork = true,
            "--inform" | "-I" => args.inform = true,
            "--verbose" | "-v" => args.verbose = true,
            "--debug" | "-d" => args.debug = true,
            "--config" | "-f" => {
                args.config_path = it.next().ok_or_else(|| "--config requires a path argument".to_string())?;
            },
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(ParseOutcome::Run(args))
}

fn help_text() -> String {
    "cf-serverd [--config PATH] [--no-fork] [--inform] [--verbose] [--debug] [--version] [--help]".to_string()
}

fn version_text() -> String {
    format!("cf-serverd {}", env!("CARGO_PKG_VERSION"))
}
