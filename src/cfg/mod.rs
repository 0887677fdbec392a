//! This module handles configuration, command-line parsing, and logging.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Command-line interface parsing.
pub mod cli;
/// Configuration file parsing and management.
pub mod config;
/// Enumerations used in configuration.
pub mod enums;
/// Logger initialization.
pub mod logger;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::cfg::config::Config;

/// Publishes a live `Arc<Config>` snapshot that readers can clone without
/// ever observing a half-reloaded document. `reload` re-runs the loader and
/// publishes the result; readers that already hold a clone keep the old
/// snapshot until they next call [`ConfigHandle::current`].
#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<Config>>,
    tx: Arc<watch::Sender<Arc<Config>>>,
    path: std::path::PathBuf,
}

impl ConfigHandle {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = cli::resolve_config_path(path.as_ref().to_string_lossy().as_ref())?;
        let cfg = Config::load_from_file(&path)?;
        let (tx, rx) = watch::channel(Arc::new(cfg));
        Ok(Self {
            rx,
            tx: Arc::new(tx),
            path,
        })
    }

    pub fn current(&self) -> Arc<Config> {
        self.rx.borrow().clone()
    }

    /// Re-reads and re-validates the document from disk and publishes it.
    /// Called from the `HUP` handler (C12).
    pub fn reload(&self) -> Result<()> {
        let cfg = Config::load_from_file(&self.path).context("config reload failed")?;
        self.tx
            .send(Arc::new(cfg))
            .map_err(|_| anyhow::anyhow!("config watch channel has no receivers"))
    }
}
