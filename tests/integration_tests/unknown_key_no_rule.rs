// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! §8 scenario: an unknown key from an address that matches no
//! `TrustKeysFrom` rule is rejected outright, and no lastseen entry is
//! created for it.

use std::net::IpAddr;

use cfnet_core::{
    key::{DigestMethod, Key},
    lastseen::Role,
    tls::decide_trust,
};

use crate::integration_tests::common::open_lastseen;

#[tokio::test]
async fn unknown_key_with_no_matching_trust_rule_is_rejected() {
    let scratch = tempfile::tempdir().expect("tmp");
    let lastseen = open_lastseen(scratch.path());
    let key = Key::construct(b"drive-by-key".to_vec(), DigestMethod::Sha256).expect("key");
    let addr: IpAddr = "198.51.100.200".parse().expect("addr");

    let err = decide_trust(&lastseen, &key, addr, Role::Inbound, &[], false, 1_000).expect_err("no rule matches");
    assert!(matches!(err, cfnet_core::error::TrustError::UntrustedPeer));

    assert_eq!(lastseen.lookup_by_fingerprint(key.fingerprint().as_bytes()).expect("lookup"), None);
    assert_eq!(lastseen.lookup_by_address(addr.to_string().as_bytes()).expect("lookup"), None);
}

#[tokio::test]
async fn a_non_matching_cidr_rule_still_rejects() {
    let scratch = tempfile::tempdir().expect("tmp");
    let lastseen = open_lastseen(scratch.path());
    let key = Key::construct(b"another-drive-by-key".to_vec(), DigestMethod::Sha256).expect("key");
    let addr: IpAddr = "198.51.100.201".parse().expect("addr");
    let unrelated_rule = ipnet::IpNet::V4("10.0.0.0/8".parse().expect("cidr"));

    let err = decide_trust(&lastseen, &key, addr, Role::Inbound, &[unrelated_rule], false, 1_000).expect_err("no rule matches");
    assert!(matches!(err, cfnet_core::error::TrustError::UntrustedPeer));
}
