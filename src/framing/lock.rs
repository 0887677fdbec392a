//! Scoped file locks (§4.2) used by the KV store and the keyring to
//! coordinate with concurrent agent processes. Acquisition is a single
//! `flock(2)` syscall on the file descriptor; release happens on scope exit
//! on every path via `Drop`.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs::File, io};

use rustix::fd::AsFd;

/// An acquired advisory lock on `file`. Released when dropped.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquires a shared (read) lock, blocking until available.
    pub fn shared_blocking(file: File) -> io::Result<Self> {
        rustix::fs::flock(file.as_fd(), rustix::fs::FlockOperation::LockShared)?;
        Ok(Self { file })
    }

    /// Acquires an exclusive (write) lock, blocking until available.
    pub fn exclusive_blocking(file: File) -> io::Result<Self> {
        rustix::fs::flock(file.as_fd(), rustix::fs::FlockOperation::LockExclusive)?;
        Ok(Self { file })
    }

    /// Tries to acquire an exclusive lock without blocking; `Ok(None)` means
    /// it is already held elsewhere.
    pub fn try_exclusive(file: File) -> io::Result<Option<Self>> {
        match rustix::fs::flock(file.as_fd(), rustix::fs::FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = rustix::fs::flock(self.file.as_fd(), rustix::fs::FlockOperation::Unlock);
    }
}
