// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: a database written by an older build (no `version` key, a
//! forward entry with no matching reverse entry) is brought up to date by
//! running the migration plan followed by the lastseen invariant repair,
//! and a second run of both does nothing further.

use cfnet_core::{
    lastseen::{LastseenIndex, RepairAction, Role},
    store::{Store, migration::{self, MigrationStep}},
};

#[tokio::test]
async fn legacy_database_migrates_and_repairs_idempotently() {
    let scratch = tempfile::tempdir().expect("tmp");
    let store = Store::open(scratch.path().join("db")).expect("open");

    // Simulate a pre-migration write: a forward entry with no reverse
    // counterpart, as an older build that didn't maintain the reverse
    // index would have left behind. No `version` key is present either.
    store.put(b"klegacy", b"10.0.0.9").expect("seed forward entry");
    assert_eq!(migration::current_version(&store).expect("version"), 0);

    let marker_applied = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let marker = marker_applied.clone();
    let plan = vec![MigrationStep::new(1, move |s| {
        marker.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        s.put(b"schema-note", b"lastseen-v1")
    })];

    migration::run(&store, &plan).expect("migrate");
    assert_eq!(migration::current_version(&store).expect("version"), 1);
    assert!(store.has_key(b"schema-note").expect("has"));

    let lastseen = LastseenIndex::new(store);
    let actions = lastseen.repair_invariants().expect("repair");
    assert!(actions.iter().any(|a| matches!(a, RepairAction::ReverseRestored { .. })));
    assert_eq!(
        lastseen.lookup_by_address(b"10.0.0.9").expect("reverse lookup"),
        Some(b"legacy".to_vec())
    );

    // A second pass over an already-migrated, already-repaired database is
    // a no-op in both layers (P4).
    let second_actions = lastseen.repair_invariants().expect("repair again");
    assert!(
        !second_actions.iter().any(|a| matches!(a, RepairAction::ReverseRestored { .. })),
        "repair should not re-fire once the invariant already holds"
    );

    lastseen.record_contact(b"legacy", b"10.0.0.9", Role::Inbound, 0.0, 5_000).expect("contact after migration");
    assert!(lastseen.quality(b"legacy", Role::Inbound).expect("quality").is_some());
}
