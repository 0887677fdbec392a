// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: a connection that sends no further requests for longer than
//! `IdleSweepAge` is reaped by the background sweep rather than left open
//! indefinitely.

use tokio::io::AsyncReadExt;

use crate::integration_tests::common::{connect_and_handshake, open_lastseen, scratch_config, spawn_pool};

#[tokio::test]
async fn idle_connection_is_closed_by_the_background_sweep() {
    let (scratch, config) = scratch_config().await;
    let idle_sweep_age = config.current().listener.idle_sweep_age;
    let lastseen = open_lastseen(&scratch.state_dir);
    let policy = cfnet_core::server::access::PolicyTree::default();
    let (addr, shutdown) = spawn_pool(config, lastseen, policy);

    let mut stream = connect_and_handshake(addr).await;

    // Never send a request; wait past the sweep age plus one sweep interval
    // so the background loop has had a chance to observe and act on it.
    tokio::time::sleep(idle_sweep_age * 3).await;

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("read did not time out")
        .expect("read did not error");
    assert_eq!(n, 0, "the sweep should have closed the idle connection");

    let _ = shutdown.send(true);
}
