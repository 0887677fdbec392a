//! Persistent ordered key-value store (§4.3, C3).
//!
//! Backed by `sled`, chosen the way the rest of this crate leans on a
//! ready-made ecosystem crate instead of hand-rolling storage: ordered
//! iteration, atomic batches and crash-safety are exactly sled's contract.
//! `sled` manages its backing store as a directory rather than the single
//! file the distilled spec describes; we treat that directory as the "file"
//! for corruption move-aside and locking purposes (documented in
//! `DESIGN.md`).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod migration;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{error, warn};

use crate::{error::StorageError, framing::lock::FileLock};

/// Name of the marker file whose presence causes the next startup to rebuild
/// every database (§4.3, §6 repair trigger).
pub const REPAIR_TRIGGER_FILE: &str = ".cfnet-repair-me";

/// An ordered, durable key-value store with cursors and atomic batches.
///
/// `_lock` is never read, only held: its `Drop` releases the exclusive lock
/// on the sidecar `.lock` file once every clone of this `Store` is gone, the
/// way the keyring coordinates with concurrent agent processes (§4.2).
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    _lock: Arc<FileLock>,
}

impl Store {
    /// Opens `path`, transparently repairing on corruption (§4.3): on a
    /// broken database the backing directory is moved aside for diagnostics
    /// and a fresh, empty database is created in its place. Takes an
    /// exclusive lock on a sidecar `.lock` file for the life of the returned
    /// `Store` so a second process opening the same path blocks instead of
    /// racing sled's own open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let lock = Arc::new(Self::acquire_lock(path)?);
        match sled::open(path) {
            Ok(db) => Ok(Self { db, _lock: lock }),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "database open failed, attempting repair");
                Self::quarantine_and_recreate(path)?;
                let db = sled::open(path)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Self { db, _lock: lock })
            },
        }
    }

    fn acquire_lock(path: &Path) -> Result<FileLock, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Backend(format!("failed to create directory for lock file: {e}")))?;
        }
        let lock_path = lock_path_for(path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StorageError::Backend(format!("failed to open lock file {}: {e}", lock_path.display())))?;
        FileLock::exclusive_blocking(file)
            .map_err(|e| StorageError::Backend(format!("failed to acquire lock on {}: {e}", lock_path.display())))
    }

    fn quarantine_and_recreate(path: &Path) -> Result<(), StorageError> {
        if path.exists() {
            let quarantined = quarantine_path(path);
            std::fs::rename(path, &quarantined)
                .map_err(|e| StorageError::Backend(format!("failed to move aside broken db: {e}")))?;
            error!(
                original = %path.display(),
                quarantined = %quarantined.display(),
                "moved broken database aside"
            );
        }
        Ok(())
    }

    /// Copies a value into a caller buffer sized by a preceding [`Store::size_of`],
    /// or use [`Store::get`] directly when the size is not needed up front.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    /// Size in bytes of the value stored at `key`, without copying it.
    pub fn size_of(&self, key: &[u8]) -> Result<Option<usize>, StorageError> {
        self.db
            .get(key)
            .map(|v| v.map(|iv| iv.len()))
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    pub fn has_key(&self, key: &[u8]) -> Result<bool, StorageError> {
        self.db
            .contains_key(key)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    /// Opens a cursor positioned before the first key.
    pub fn open_cursor(&self) -> Cursor {
        Cursor {
            db: self.db.clone(),
            last_key: None,
        }
    }

    /// Groups mutations into one atomic commit (§4.3 write batching): the
    /// backend either applies every operation or none, and concurrent
    /// readers see the pre- or post-batch state, never partial.
    pub fn batch(&self) -> BatchGuard<'_> {
        BatchGuard {
            store: self,
            batch: sled::Batch::default(),
        }
    }

    /// Flushes to durable storage. Used by callers that need a
    /// durability point outside of an explicit batch commit.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());
    name.push_str(".broken");
    path.with_file_name(name)
}

/// Sidecar lock file path for `path`, mirroring [`quarantine_path`]'s
/// suffix-rename pattern.
fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// Marks the repair trigger so the next process start rebuilds every
/// database (§4.3, §6). Called from the SIGBUS-equivalent handler.
pub fn mark_repair_trigger(state_dir: &Path) -> std::io::Result<()> {
    std::fs::write(state_dir.join(REPAIR_TRIGGER_FILE), b"")
}

/// `true` if the repair trigger is present; callers should then rebuild
/// every database and remove the marker before resuming normal operation.
pub fn repair_trigger_present(state_dir: &Path) -> bool {
    state_dir.join(REPAIR_TRIGGER_FILE).exists()
}

pub fn clear_repair_trigger(state_dir: &Path) -> std::io::Result<()> {
    let marker = state_dir.join(REPAIR_TRIGGER_FILE);
    if marker.exists() {
        std::fs::remove_file(marker)?;
    }
    Ok(())
}

/// Mutations pinned for atomic commit. Dropping without calling
/// [`BatchGuard::commit`] discards the pending mutations.
pub struct BatchGuard<'a> {
    store: &'a Store,
    batch: sled::Batch,
}

impl BatchGuard<'_> {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.batch.insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.batch.remove(key);
    }

    /// Commits every pinned mutation atomically.
    pub fn commit(self) -> Result<(), StorageError> {
        self.store
            .db
            .apply_batch(self.batch)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

/// A cursor over the store's lexicographic key order. Deleting or
/// overwriting the entry the cursor currently points at does not prevent
/// advancing: the next call returns the next surviving key in sort order
/// (§4.3, P5), because the cursor tracks the last key it returned and
/// re-queries the tree rather than holding a live iterator handle.
pub struct Cursor {
    db: sled::Db,
    last_key: Option<Vec<u8>>,
}

impl Cursor {
    /// Advances to the next key strictly greater than the last one
    /// returned (or the smallest key, on the first call).
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        let next_item = match &self.last_key {
            None => self.db.iter().next(),
            Some(k) => {
                let mut range = self.db.range((std::ops::Bound::Excluded(k.clone()), std::ops::Bound::Unbounded));
                range.next()
            },
        };
        match next_item {
            None => Ok(None),
            Some(Ok((k, v))) => {
                self.last_key = Some(k.to_vec());
                Ok(Some((k.to_vec(), v.to_vec())))
            },
            Some(Err(e)) => Err(StorageError::Backend(e.to_string())),
        }
    }

    /// Deletes the entry at the cursor's current position (the last key
    /// returned by [`Cursor::next`]). Does not move the cursor.
    pub fn delete_current(&self) -> Result<(), StorageError> {
        if let Some(k) = &self.last_key {
            self.db
                .remove(k)
                .map(|_| ())
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    /// Overwrites the value at the cursor's current position.
    pub fn write_current(&self, value: &[u8]) -> Result<(), StorageError> {
        if let Some(k) = &self.last_key {
            self.db
                .insert(k, value)
                .map(|_| ())
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempdir().expect("tmp");
        let store = Store::open(dir.path().join("db")).expect("open");
        store.put(b"k1", b"v1").expect("put");
        assert_eq!(store.get(b"k1").expect("get"), Some(b"v1".to_vec()));
        assert!(store.has_key(b"k1").expect("has"));
        store.delete(b"k1").expect("delete");
        assert_eq!(store.get(b"k1").expect("get"), None);
    }

    #[test]
    fn batch_commits_atomically() {
        let dir = tempdir().expect("tmp");
        let store = Store::open(dir.path().join("db")).expect("open");
        let mut batch = store.batch();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.commit().expect("commit");
        assert_eq!(store.get(b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn cursor_survives_deletion_of_current_entry() {
        // P5: deleting k (or overwriting it) leaves the cursor advanceable;
        // next() returns next(k) in sort order.
        let dir = tempdir().expect("tmp");
        let store = Store::open(dir.path().join("db")).expect("open");
        store.put(b"a", b"1").expect("put");
        store.put(b"b", b"2").expect("put");
        store.put(b"c", b"3").expect("put");

        let mut cursor = store.open_cursor();
        let (k, _) = cursor.next().expect("next").expect("some");
        assert_eq!(k, b"a");
        cursor.delete_current().expect("delete");

        let (k2, v2) = cursor.next().expect("next").expect("some");
        assert_eq!(k2, b"b");
        assert_eq!(v2, b"2");
    }

    #[test]
    fn cursor_survives_overwrite_of_current_entry() {
        let dir = tempdir().expect("tmp");
        let store = Store::open(dir.path().join("db")).expect("open");
        store.put(b"a", b"1").expect("put");
        store.put(b"b", b"2").expect("put");

        let mut cursor = store.open_cursor();
        cursor.next().expect("next");
        cursor.write_current(b"overwritten").expect("write");
        assert_eq!(store.get(b"a").expect("get"), Some(b"overwritten".to_vec()));

        let (k2, _) = cursor.next().expect("next").expect("some");
        assert_eq!(k2, b"b");
    }

    #[test]
    fn open_takes_an_exclusive_lock_released_on_drop() {
        let dir = tempdir().expect("tmp");
        let db_path = dir.path().join("db");
        let store = Store::open(&db_path).expect("open");
        assert!(lock_path_for(&db_path).exists());
        drop(store);

        // Re-opening after the first Store is dropped must not block.
        let store2 = Store::open(&db_path).expect("reopen");
        store2.put(b"k", b"v").expect("put");
    }

    #[test]
    fn repair_trigger_marker_round_trips() {
        let dir = tempdir().expect("tmp");
        assert!(!repair_trigger_present(dir.path()));
        mark_repair_trigger(dir.path()).expect("mark");
        assert!(repair_trigger_present(dir.path()));
        clear_repair_trigger(dir.path()).expect("clear");
        assert!(!repair_trigger_present(dir.path()));
    }
}
