//! Access control for the server command dispatcher (§4.7): longest-prefix
//! matching for filesystem paths, exact matching for identifiers such as
//! `VAR`/`CONTEXT` names, both scoped to the connecting peer's fingerprint,
//! address, or hostname.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::server::state::ConnectionInfo;

bitflags::bitflags! {
    /// Permissions a policy rule may grant. `EXEC` is distinct from `READ`
    /// because `GET`/`OPENDIR` only need read access while `EXEC` runs code.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AccessSet: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

/// Which peer a rule applies to. Every `None` field is a wildcard; a rule
/// with every field `None` matches any peer.
#[derive(Debug, Clone, Default)]
pub struct PeerMatch {
    pub fingerprint: Option<String>,
    pub address: Option<ipnet::IpNet>,
    pub hostname: Option<String>,
}

impl PeerMatch {
    /// Matches every peer.
    pub fn any() -> Self {
        Self::default()
    }

    fn matches(&self, info: &ConnectionInfo) -> bool {
        if let Some(fingerprint) = &self.fingerprint
            && fingerprint != &info.remote_key_fingerprint
        {
            return false;
        }
        if let Some(net) = &self.address
            && !net.contains(&info.remote_address)
        {
            return false;
        }
        if let Some(hostname) = &self.hostname
            && hostname != &info.username
        {
            return false;
        }
        true
    }
}

/// One rule in the policy tree: either a path prefix (longest match wins)
/// or an exact identifier (`VAR`/`CONTEXT`/`QUERY` name), scoped to `peer`.
#[derive(Debug, Clone)]
pub enum Rule {
    PathPrefix { prefix: String, access: AccessSet, peer: PeerMatch },
    Identifier { name: String, access: AccessSet, peer: PeerMatch },
}

/// The access-control policy loaded from `PathsConfig::policy_root` (§4.10).
#[derive(Debug, Clone, Default)]
pub struct PolicyTree {
    rules: Vec<Rule>,
}

impl PolicyTree {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Grants the union of every path-prefix rule whose prefix is a
    /// component-wise ancestor of `path` and whose peer matcher matches
    /// `info`, weighted toward the longest matching prefix: a longer, more
    /// specific prefix's grant replaces (rather than merely adds to) a
    /// shorter one's.
    pub fn access_for_path(&self, path: &str, info: &ConnectionInfo) -> AccessSet {
        let mut best: Option<(&str, AccessSet)> = None;
        for rule in &self.rules {
            if let Rule::PathPrefix { prefix, access, peer } = rule
                && path.starts_with(prefix.as_str())
                && peer.matches(info)
                && best.is_none_or(|(b, _)| prefix.len() > b.len())
            {
                best = Some((prefix, *access));
            }
        }
        best.map(|(_, a)| a).unwrap_or(AccessSet::empty())
    }

    /// Grants the access of the first identifier rule whose name matches
    /// `name` exactly and whose peer matcher matches `info`.
    pub fn access_for_identifier(&self, name: &str, info: &ConnectionInfo) -> AccessSet {
        self.rules
            .iter()
            .find_map(|r| match r {
                Rule::Identifier { name: n, access, peer } if n == name && peer.matches(info) => Some(*access),
                _ => None,
            })
            .unwrap_or(AccessSet::empty())
    }

    /// Grants the union of every rule's access whose peer matcher matches
    /// `info`, ignoring the requested resource. Computed once per
    /// connection and cached as a coarse per-peer ceiling independent of
    /// which path or identifier a given request names.
    pub fn access_for_peer(&self, info: &ConnectionInfo) -> AccessSet {
        self.rules.iter().fold(AccessSet::empty(), |acc, rule| {
            let (access, peer) = match rule {
                Rule::PathPrefix { access, peer, .. } => (access, peer),
                Rule::Identifier { access, peer, .. } => (access, peer),
            };
            if peer.matches(info) { acc | *access } else { acc }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            negotiated_version: 2,
            remote_key_fingerprint: "sha256=deadbeef".to_string(),
            remote_address: "10.0.0.5".parse().expect("ip"),
            username: "root".to_string(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let tree = PolicyTree::new(vec![
            Rule::PathPrefix {
                prefix: "/var/cfengine".to_string(),
                access: AccessSet::READ,
                peer: PeerMatch::any(),
            },
            Rule::PathPrefix {
                prefix: "/var/cfengine/inputs".to_string(),
                access: AccessSet::READ | AccessSet::WRITE,
                peer: PeerMatch::any(),
            },
        ]);
        assert_eq!(
            tree.access_for_path("/var/cfengine/inputs/promises.cf", &info()),
            AccessSet::READ | AccessSet::WRITE
        );
        assert_eq!(tree.access_for_path("/var/cfengine/state/x", &info()), AccessSet::READ);
    }

    #[test]
    fn unmatched_path_has_no_access() {
        let tree = PolicyTree::default();
        assert_eq!(tree.access_for_path("/etc/shadow", &info()), AccessSet::empty());
    }

    #[test]
    fn identifier_rules_match_exactly() {
        let tree = PolicyTree::new(vec![Rule::Identifier {
            name: "sys.policy_hub".to_string(),
            access: AccessSet::READ,
            peer: PeerMatch::any(),
        }]);
        assert_eq!(tree.access_for_identifier("sys.policy_hub", &info()), AccessSet::READ);
        assert_eq!(tree.access_for_identifier("sys.other", &info()), AccessSet::empty());
    }

    #[test]
    fn rule_scoped_to_a_fingerprint_ignores_other_peers() {
        let tree = PolicyTree::new(vec![Rule::PathPrefix {
            prefix: "/var/cfengine".to_string(),
            access: AccessSet::READ,
            peer: PeerMatch {
                fingerprint: Some("sha256=deadbeef".to_string()),
                ..PeerMatch::any()
            },
        }]);
        assert_eq!(tree.access_for_path("/var/cfengine/inputs/x", &info()), AccessSet::READ);

        let mut other = info();
        other.remote_key_fingerprint = "sha256=cafef00d".to_string();
        assert_eq!(tree.access_for_path("/var/cfengine/inputs/x", &other), AccessSet::empty());
    }

    #[test]
    fn rule_scoped_to_a_cidr_ignores_addresses_outside_it() {
        let tree = PolicyTree::new(vec![Rule::PathPrefix {
            prefix: "/var/cfengine".to_string(),
            access: AccessSet::READ,
            peer: PeerMatch {
                address: Some("10.0.0.0/24".parse().expect("cidr")),
                ..PeerMatch::any()
            },
        }]);
        assert_eq!(tree.access_for_path("/var/cfengine/inputs/x", &info()), AccessSet::READ);

        let mut outside = info();
        outside.remote_address = "192.168.1.5".parse().expect("ip");
        assert_eq!(tree.access_for_path("/var/cfengine/inputs/x", &outside), AccessSet::empty());
    }

    #[test]
    fn access_for_peer_unions_every_matching_rule_regardless_of_resource() {
        let tree = PolicyTree::new(vec![
            Rule::PathPrefix {
                prefix: "/var/cfengine".to_string(),
                access: AccessSet::READ,
                peer: PeerMatch::any(),
            },
            Rule::Identifier {
                name: "sys.policy_hub".to_string(),
                access: AccessSet::EXEC,
                peer: PeerMatch::any(),
            },
        ]);
        assert_eq!(tree.access_for_peer(&info()), AccessSet::READ | AccessSet::EXEC);
    }
}
