// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: an unknown key from an address covered by `TrustKeysFrom` is
//! installed on first contact (TOFU); reconnecting later from the same key
//! and address is then trusted outright, with no further TOFU install.

use std::net::{IpAddr, Ipv4Addr};

use cfnet_core::{
    key::{DigestMethod, Key},
    lastseen::{LastseenIndex, Role},
    store::Store,
    tls::{TrustOutcome, decide_trust},
};

use crate::integration_tests::common::open_lastseen;

fn any_v4() -> ipnet::IpNet {
    ipnet::IpNet::V4(ipnet::Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0"))
}

#[tokio::test]
async fn unknown_key_is_installed_then_trusted_on_reconnect() {
    let scratch = tempfile::tempdir().expect("tmp");
    let lastseen = open_lastseen(scratch.path());
    let key = Key::construct(b"peer-one-public-key".to_vec(), DigestMethod::Sha256).expect("key");
    let addr: IpAddr = "192.0.2.10".parse().expect("addr");
    let trust_rules = vec![any_v4()];

    let first = decide_trust(&lastseen, &key, addr, Role::Inbound, &trust_rules, false, 1_000).expect("first contact");
    assert_eq!(first, TrustOutcome::TofuInstalled);

    let second = decide_trust(&lastseen, &key, addr, Role::Inbound, &trust_rules, false, 1_100).expect("second contact");
    assert_eq!(second, TrustOutcome::Trusted);

    assert_eq!(
        lastseen.lookup_by_fingerprint(key.fingerprint().as_bytes()).expect("lookup"),
        Some(addr.to_string().into_bytes())
    );
}

#[tokio::test]
async fn reconnect_keeps_updating_quality_without_reinstalling() {
    let scratch = tempfile::tempdir().expect("tmp");
    let store = Store::open(scratch.path().join("db")).expect("open");
    let lastseen = LastseenIndex::new(store);
    let key = Key::construct(b"peer-two-public-key".to_vec(), DigestMethod::Sha256).expect("key");
    let addr: IpAddr = "198.51.100.7".parse().expect("addr");
    let trust_rules = vec![any_v4()];

    decide_trust(&lastseen, &key, addr, Role::Outbound, &trust_rules, false, 1_000).expect("install");
    for epoch in [1_010, 1_030, 1_070] {
        let outcome = decide_trust(&lastseen, &key, addr, Role::Outbound, &trust_rules, false, epoch).expect("contact");
        assert_eq!(outcome, TrustOutcome::Trusted);
    }

    let quality = lastseen.quality(key.fingerprint().as_bytes(), Role::Outbound).expect("quality").expect("some");
    assert!(quality.acknowledged);
}
