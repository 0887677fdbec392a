//! Bidirectional hostkey↔address index with rolling quality-of-connection
//! statistics, layered on the KV store (§4.4, C4).
//!
//! Keys are namespaced by a single-byte prefix: `k<fingerprint>` (forward),
//! `a<address>` (reverse), `q[io]<fingerprint>` (quality, one record per
//! role). The bare `version` key is shared with [`crate::store::migration`].

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

use crate::{
    error::StorageError,
    store::Store,
};

const FORWARD_PREFIX: u8 = b'k';
const REVERSE_PREFIX: u8 = b'a';
const QUALITY_PREFIX: u8 = b'q';

/// Smoothing factor for the rolling quality-of-connection average (§4.4).
const ALPHA: f64 = 0.7;

/// Which side of the connection this quality record describes. Inbound and
/// outbound contact with the same peer are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Inbound,
    Outbound,
}

impl Role {
    fn byte(self) -> u8 {
        match self {
            Role::Inbound => b'i',
            Role::Outbound => b'o',
        }
    }
}

/// Rolling quality-of-connection statistics for one peer/role pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityPoint {
    pub q: f64,
    pub expect: f64,
    pub variance: f64,
    pub delta_q: f64,
}

impl Default for QualityPoint {
    fn default() -> Self {
        Self {
            q: 0.0,
            expect: 0.0,
            variance: 0.0,
            delta_q: 0.0,
        }
    }
}

impl QualityPoint {
    /// Folds one new contact interval into the rolling average (§4.4):
    /// `expect ← α·interval + (1−α)·expect`,
    /// `variance ← α·(interval−expect)² + (1−α)·variance`.
    fn update(&mut self, interval: f64) {
        self.delta_q = interval - self.expect;
        self.expect = ALPHA * interval + (1.0 - ALPHA) * self.expect;
        self.variance = ALPHA * self.delta_q.powi(2) + (1.0 - ALPHA) * self.variance;
        self.q = self.expect;
    }
}

/// Value stored under a `q[io]<fingerprint>` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentityRecord {
    pub last_seen_epoch: i64,
    pub quality_point: QualityPoint,
    pub acknowledged: bool,
}

/// A detail found (and fixed) by [`LastseenIndex::repair_invariants`].
#[derive(Debug, Clone, PartialEq)]
pub enum RepairAction {
    /// A forward entry had no matching reverse entry; the reverse entry
    /// was (re)written (I1).
    ReverseRestored { fingerprint: Vec<u8> },
    /// A reverse entry pointed at a fingerprint with no forward entry; the
    /// dangling reverse entry was removed (I1).
    DanglingReverseRemoved { address: Vec<u8> },
    /// A quality record existed with no matching forward entry; removed
    /// (I2).
    OrphanedQualityRemoved { fingerprint: Vec<u8>, role: Role },
    /// `version` was absent; initialized to `0` (I3).
    VersionInitialized,
}

fn forward_key(fingerprint: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + fingerprint.len());
    k.push(FORWARD_PREFIX);
    k.extend_from_slice(fingerprint);
    k
}

fn reverse_key(address: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + address.len());
    k.push(REVERSE_PREFIX);
    k.extend_from_slice(address);
    k
}

fn quality_key(fingerprint: &[u8], role: Role) -> Vec<u8> {
    let mut k = Vec::with_capacity(2 + fingerprint.len());
    k.push(QUALITY_PREFIX);
    k.push(role.byte());
    k.extend_from_slice(fingerprint);
    k
}

/// The lastseen index, layered on a [`Store`].
pub struct LastseenIndex {
    store: Store,
}

impl LastseenIndex {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records successful authenticated contact with a peer (§4.4): updates
    /// the forward/reverse maps and folds `interval` (seconds since the
    /// previous contact in this role, or `0.0` on first contact) into the
    /// rolling quality average. `now_epoch` is the caller's current time, to
    /// keep this module free of a direct clock dependency.
    pub fn record_contact(
        &self,
        fingerprint: &[u8],
        address: &[u8],
        role: Role,
        interval: f64,
        now_epoch: i64,
    ) -> Result<(), StorageError> {
        let qkey = quality_key(fingerprint, role);
        let mut record = match self.store.get(&qkey)? {
            Some(bytes) => decode_record(&bytes)?,
            None => PeerIdentityRecord {
                last_seen_epoch: now_epoch,
                quality_point: QualityPoint::default(),
                acknowledged: false,
            },
        };
        record.quality_point.update(interval);
        record.last_seen_epoch = now_epoch;
        record.acknowledged = true;

        let mut batch = self.store.batch();
        batch.put(&forward_key(fingerprint), address);
        batch.put(&reverse_key(address), fingerprint);
        batch.put(&qkey, &encode_record(&record)?);
        batch.commit()
    }

    /// Looks up the address last associated with `fingerprint`.
    pub fn lookup_by_fingerprint(&self, fingerprint: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.get(&forward_key(fingerprint))
    }

    /// Looks up the fingerprint last associated with `address`.
    pub fn lookup_by_address(&self, address: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.get(&reverse_key(address))
    }

    /// Fetches the quality record for `fingerprint` in the given role.
    pub fn quality(&self, fingerprint: &[u8], role: Role) -> Result<Option<PeerIdentityRecord>, StorageError> {
        match self.store.get(&quality_key(fingerprint, role))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes a peer's forward entry, its reverse entry, and both of its
    /// quality records (inbound and outbound) atomically.
    pub fn remove_peer(&self, fingerprint: &[u8]) -> Result<(), StorageError> {
        let mut batch = self.store.batch();
        if let Some(address) = self.store.get(&forward_key(fingerprint))? {
            batch.delete(&reverse_key(&address));
        }
        batch.delete(&forward_key(fingerprint));
        batch.delete(&quality_key(fingerprint, Role::Inbound));
        batch.delete(&quality_key(fingerprint, Role::Outbound));
        batch.commit()
    }

    /// Enumerates every `(fingerprint, address)` forward entry.
    pub fn enumerate_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        let mut cursor = self.store.open_cursor();
        while let Some((key, value)) = cursor.next()? {
            if key.first() == Some(&FORWARD_PREFIX) {
                out.push((key[1..].to_vec(), value));
            }
        }
        Ok(out)
    }

    /// Audits and repairs the invariants I1–I3 (§3): every forward entry has
    /// a matching reverse entry and vice versa, every quality record has a
    /// matching forward entry, and `version` is present. Run after a schema
    /// migration and on operator demand.
    pub fn repair_invariants(&self) -> Result<Vec<RepairAction>, StorageError> {
        let mut actions = Vec::new();
        let mut forward = std::collections::HashMap::new();
        let mut reverse = std::collections::HashMap::new();
        let mut quality_fingerprints: Vec<(Vec<u8>, Role)> = Vec::new();

        let mut cursor = self.store.open_cursor();
        while let Some((key, value)) = cursor.next()? {
            match key.first() {
                Some(&FORWARD_PREFIX) => {
                    forward.insert(key[1..].to_vec(), value);
                },
                Some(&REVERSE_PREFIX) => {
                    reverse.insert(key[1..].to_vec(), value);
                },
                Some(&QUALITY_PREFIX) if key.len() >= 2 => {
                    let role = if key[1] == b'i' { Role::Inbound } else { Role::Outbound };
                    quality_fingerprints.push((key[2..].to_vec(), role));
                },
                _ => {},
            }
        }

        let mut batch = self.store.batch();
        for (fingerprint, address) in &forward {
            let expected_reverse = reverse.get(address);
            if expected_reverse != Some(fingerprint) {
                batch.put(&reverse_key(address), fingerprint);
                actions.push(RepairAction::ReverseRestored {
                    fingerprint: fingerprint.clone(),
                });
            }
        }
        for (address, fingerprint) in &reverse {
            if !forward.contains_key(fingerprint) {
                batch.delete(&reverse_key(address));
                actions.push(RepairAction::DanglingReverseRemoved {
                    address: address.clone(),
                });
            }
        }
        for (fingerprint, role) in &quality_fingerprints {
            if !forward.contains_key(fingerprint) {
                batch.delete(&quality_key(fingerprint, *role));
                actions.push(RepairAction::OrphanedQualityRemoved {
                    fingerprint: fingerprint.clone(),
                    role: *role,
                });
            }
        }
        if self.store.get(crate::store::migration::VERSION_KEY)?.is_none() {
            batch.put(crate::store::migration::VERSION_KEY, b"0");
            actions.push(RepairAction::VersionInitialized);
        }
        batch.commit()?;
        Ok(actions)
    }
}

fn encode_record(record: &PeerIdentityRecord) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(|e| StorageError::Backend(e.to_string()))
}

fn decode_record(bytes: &[u8]) -> Result<PeerIdentityRecord, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Backend(e.to_string()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open() -> LastseenIndex {
        let dir = tempdir().expect("tmp");
        // Leaked so the tempdir survives for the life of the test; each test
        // gets its own directory so there's no cross-test interference.
        let path = Box::leak(Box::new(dir)).path().join("db");
        LastseenIndex::new(Store::open(path).expect("open"))
    }

    #[test]
    fn forward_and_reverse_agree_after_contact() {
        // P3: bidirectionality.
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 0.0, 1000)
            .expect("record");
        assert_eq!(
            idx.lookup_by_fingerprint(b"fp1").expect("fwd"),
            Some(b"10.0.0.1".to_vec())
        );
        assert_eq!(
            idx.lookup_by_address(b"10.0.0.1").expect("rev"),
            Some(b"fp1".to_vec())
        );
    }

    #[test]
    fn inbound_and_outbound_quality_are_independent() {
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 10.0, 1000)
            .expect("record");
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Outbound, 20.0, 1000)
            .expect("record");
        let inbound = idx.quality(b"fp1", Role::Inbound).expect("q").expect("some");
        let outbound = idx.quality(b"fp1", Role::Outbound).expect("q").expect("some");
        assert_ne!(inbound.quality_point.expect, outbound.quality_point.expect);
    }

    #[test]
    fn remove_peer_clears_both_directions_and_both_roles() {
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 0.0, 1000)
            .expect("record");
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Outbound, 0.0, 1000)
            .expect("record");
        idx.remove_peer(b"fp1").expect("remove");
        assert_eq!(idx.lookup_by_fingerprint(b"fp1").expect("fwd"), None);
        assert_eq!(idx.lookup_by_address(b"10.0.0.1").expect("rev"), None);
        assert_eq!(idx.quality(b"fp1", Role::Inbound).expect("q"), None);
        assert_eq!(idx.quality(b"fp1", Role::Outbound).expect("q"), None);
    }

    #[test]
    fn repair_restores_missing_reverse_entry() {
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 0.0, 1000)
            .expect("record");
        idx.store.delete(&reverse_key(b"10.0.0.1")).expect("delete reverse");
        assert_eq!(idx.lookup_by_address(b"10.0.0.1").expect("rev"), None);

        let actions = idx.repair_invariants().expect("repair");
        assert!(actions.iter().any(|a| matches!(a, RepairAction::ReverseRestored { .. })));
        assert_eq!(
            idx.lookup_by_address(b"10.0.0.1").expect("rev"),
            Some(b"fp1".to_vec())
        );
    }

    #[test]
    fn repair_removes_orphaned_quality_record() {
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 0.0, 1000)
            .expect("record");
        idx.store.delete(&forward_key(b"fp1")).expect("delete forward");

        let actions = idx.repair_invariants().expect("repair");
        assert!(actions
            .iter()
            .any(|a| matches!(a, RepairAction::OrphanedQualityRemoved { .. })));
        assert_eq!(idx.quality(b"fp1", Role::Inbound).expect("q"), None);
    }

    #[test]
    fn repair_initializes_missing_version() {
        let idx = open();
        let actions = idx.repair_invariants().expect("repair");
        assert!(actions.contains(&RepairAction::VersionInitialized));
        assert_eq!(
            idx.store.get(crate::store::migration::VERSION_KEY).expect("get"),
            Some(b"0".to_vec())
        );
    }

    #[test]
    fn enumerate_all_lists_every_peer() {
        let idx = open();
        idx.record_contact(b"fp1", b"10.0.0.1", Role::Inbound, 0.0, 1000)
            .expect("record");
        idx.record_contact(b"fp2", b"10.0.0.2", Role::Inbound, 0.0, 1000)
            .expect("record");
        let mut all = idx.enumerate_all().expect("enumerate");
        all.sort();
        assert_eq!(
            all,
            vec![
                (b"fp1".to_vec(), b"10.0.0.1".to_vec()),
                (b"fp2".to_vec(), b"10.0.0.2".to_vec()),
            ]
        );
    }
}
