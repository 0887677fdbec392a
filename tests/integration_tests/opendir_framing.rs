// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: an `OPENDIR` request against a directory containing `a`,
//! `b`, `c` comes back framed as one transaction whose body is the multiset
//! `{a, b, c, ., ..}`, NUL-separated, sorted, terminated by `CFD_TERMINATOR`.

use cfnet_core::{framing::transaction::{read_message, write_frame}, wire::CFD_TERMINATOR};

use crate::integration_tests::common::{FRAME_DEADLINE, connect_and_handshake, open_lastseen, scratch_config, spawn_pool};

#[tokio::test]
async fn opendir_lists_the_full_multiset_framed_and_terminated() {
    let (scratch, config) = scratch_config().await;
    let lastseen = open_lastseen(&scratch.state_dir);
    let policy = cfnet_core::server::access::PolicyTree::default();
    let (addr, shutdown) = spawn_pool(config, lastseen, policy);

    let listing_dir = scratch.dir.path().join("listing");
    std::fs::create_dir_all(&listing_dir).expect("mkdir");
    for name in ["a", "b", "c"] {
        std::fs::write(listing_dir.join(name), b"").expect("write");
    }

    let mut stream = connect_and_handshake(addr).await;
    let request = format!("OPENDIR {}", listing_dir.display());
    write_frame(&mut stream, request.as_bytes(), false, FRAME_DEADLINE)
        .await
        .expect("write request");
    let response = read_message(&mut stream, 1 << 16, FRAME_DEADLINE).await.expect("read response");
    let text = String::from_utf8(response).expect("utf8");

    assert!(text.ends_with(CFD_TERMINATOR), "listing must end with the terminator: {text:?}");
    let entries: std::collections::BTreeSet<&str> = text.trim_end_matches(CFD_TERMINATOR).trim_end_matches('\0').split('\0').collect();
    assert_eq!(entries, std::collections::BTreeSet::from(["a", "b", "c", ".", ".."]));

    let _ = shutdown.send(true);
}
