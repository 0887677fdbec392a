// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: a known key reconnecting from a new address is trusted and
//! the recorded address is updated, unless strict mode is on, in which case
//! the address change is rejected outright (§4.5 step 3, §4.6).

use std::net::{IpAddr, Ipv4Addr};

use cfnet_core::{
    key::{DigestMethod, Key},
    lastseen::Role,
    tls::{TrustOutcome, decide_trust},
};

use crate::integration_tests::common::open_lastseen;

fn any_v4() -> ipnet::IpNet {
    ipnet::IpNet::V4(ipnet::Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0"))
}

#[tokio::test]
async fn known_key_at_new_address_is_trusted_and_address_updates() {
    let scratch = tempfile::tempdir().expect("tmp");
    let lastseen = open_lastseen(scratch.path());
    let key = Key::construct(b"roaming-host-key".to_vec(), DigestMethod::Sha256).expect("key");
    let first_addr: IpAddr = "203.0.113.5".parse().expect("addr");
    let second_addr: IpAddr = "203.0.113.99".parse().expect("addr");
    let trust_rules = vec![any_v4()];

    decide_trust(&lastseen, &key, first_addr, Role::Inbound, &trust_rules, false, 1_000).expect("install");

    let outcome = decide_trust(&lastseen, &key, second_addr, Role::Inbound, &trust_rules, false, 2_000).expect("reconnect");
    assert_eq!(outcome, TrustOutcome::TrustedAddressUpdated);
    assert_eq!(
        lastseen.lookup_by_fingerprint(key.fingerprint().as_bytes()).expect("lookup"),
        Some(second_addr.to_string().into_bytes())
    );
}

#[tokio::test]
async fn strict_mode_rejects_an_address_change() {
    let scratch = tempfile::tempdir().expect("tmp");
    let lastseen = open_lastseen(scratch.path());
    let key = Key::construct(b"pinned-host-key".to_vec(), DigestMethod::Sha256).expect("key");
    let first_addr: IpAddr = "203.0.113.5".parse().expect("addr");
    let second_addr: IpAddr = "203.0.113.99".parse().expect("addr");
    let trust_rules = vec![any_v4()];

    decide_trust(&lastseen, &key, first_addr, Role::Inbound, &trust_rules, false, 1_000).expect("install");

    let err = decide_trust(&lastseen, &key, second_addr, Role::Inbound, &trust_rules, true, 2_000).expect_err("strict reject");
    assert!(matches!(err, cfnet_core::error::TrustError::UntrustedPeer));
    assert_eq!(
        lastseen.lookup_by_fingerprint(key.fingerprint().as_bytes()).expect("lookup"),
        Some(first_addr.to_string().into_bytes()),
        "the recorded address must be unchanged after a rejected reconnect"
    );
}
