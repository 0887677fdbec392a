//! Versioned schema migration for a [`Store`](super::Store) (§4.3).
//!
//! Each database carries a `version` entry (absent means `0`). A migration
//! plan is an ordered list of steps; on open, every step whose target is
//! greater than the current version runs in order. A step is a total
//! function over the database's contents and is responsible for leaving
//! `version` set to its own target once it has applied its changes, so a
//! crash mid-step never leaves the version entry ahead of the data it
//! describes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{error::StorageError, store::Store};

/// Key under which the schema version is stored, shared by every database
/// that uses this migration framework.
pub const VERSION_KEY: &[u8] = b"version";

type StepFn = dyn Fn(&Store) -> Result<(), StorageError> + Send + Sync;

/// One migration step: run `apply` to move the database to `target`.
pub struct MigrationStep {
    pub target: u64,
    apply: Box<StepFn>,
}

impl MigrationStep {
    pub fn new(target: u64, apply: impl Fn(&Store) -> Result<(), StorageError> + Send + Sync + 'static) -> Self {
        Self {
            target,
            apply: Box::new(apply),
        }
    }
}

/// Reads the current schema version, defaulting to `0` when the `version`
/// key is absent (a freshly created database, or one predating this
/// framework).
pub fn current_version(store: &Store) -> Result<u64, StorageError> {
    match store.get(VERSION_KEY)? {
        None => Ok(0),
        Some(bytes) => {
            let s = String::from_utf8_lossy(&bytes);
            s.parse::<u64>()
                .map_err(|e| StorageError::MigrationFailed {
                    target: 0,
                    detail: format!("unparseable version entry {s:?}: {e}"),
                })
        },
    }
}

fn set_version(store: &Store, version: u64) -> Result<(), StorageError> {
    store.put(VERSION_KEY, version.to_string().as_bytes())
}

/// The schema steps a freshly started process applies to its store before
/// touching any other subsystem (§4.12 startup order). Empty today — no
/// schema version beyond 0 has shipped yet — but `main` wires `run` against
/// this plan now so the first real step only has to be appended here.
pub fn startup_plan() -> Vec<MigrationStep> {
    vec![]
}

/// Runs every step in `plan` whose target exceeds the database's current
/// version, in order. Idempotent: re-running against an up-to-date
/// database is a no-op (P4), since every step's target is compared against
/// the version the previous step already committed.
pub fn run(store: &Store, plan: &[MigrationStep]) -> Result<(), StorageError> {
    let mut version = current_version(store)?;
    for step in plan {
        if step.target <= version {
            continue;
        }
        (step.apply)(store).map_err(|e| StorageError::MigrationFailed {
            target: step.target,
            detail: e.to_string(),
        })?;
        set_version(store, step.target)?;
        version = step.target;
    }
    Ok(())
}
