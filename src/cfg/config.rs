// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{DigestMethod, YesNo};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Listener bind address, concurrency limits, and reap/grace timers.
    pub listener: ListenerConfig,
    /// Trust policy: TOFU rules, strict mode, keyring location.
    pub trust: TrustConfig,
    /// On-disk layout: state directory, policy root, repair marker name.
    pub paths: PathsConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Listener-facing knobs (§4.8).
pub struct ListenerConfig {
    #[serde(rename = "BindAddress")]
    /// Address and port the server listens on.
    pub bind_address: SocketAddr,

    #[serde(default = "default_backlog", rename = "Backlog")]
    /// Kernel accept backlog depth.
    pub backlog: u32,

    #[serde(default = "default_max_connections", rename = "MaxConnections")]
    /// Concurrent connections served before new ones queue or are refused.
    pub max_connections: u32,

    #[serde(default = "default_max_queue_wait", rename = "MaxQueueWait", with = "serde_secs")]
    /// How long an over-capacity connection waits for a worker slot before
    /// receiving `"BAD: busy"`.
    pub max_queue_wait: Duration,

    #[serde(default = "default_idle_timeout", rename = "IdleTimeout", with = "serde_secs")]
    /// Per-connection idle timeout before moving to `Terminating` (§4.7).
    pub idle_timeout: Duration,

    #[serde(default = "default_sweep_interval", rename = "IdleSweepInterval", with = "serde_secs")]
    /// How often the idle sweep walks the connection set (§4.8).
    pub idle_sweep_interval: Duration,

    #[serde(default = "default_sweep_age", rename = "IdleSweepAge", with = "serde_secs")]
    /// Connection age beyond which the idle sweep closes it outright.
    pub idle_sweep_age: Duration,

    #[serde(default = "default_grace_period", rename = "ReloadGracePeriod", with = "serde_secs")]
    /// How long a reload (`HUP`) waits for existing connections to drain.
    pub reload_grace_period: Duration,

    #[serde(default, rename = "LegacyProtocol")]
    /// Opt-in for the pre-TLS legacy session (§4.6), disabled by default.
    pub legacy_protocol: YesNo,
}

fn default_backlog() -> u32 {
    128
}
fn default_max_connections() -> u32 {
    256
}
fn default_max_queue_wait() -> Duration {
    Duration::from_secs(5)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_sweep_age() -> Duration {
    Duration::from_secs(7200)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Trust-plane policy (§4.5 step 3).
pub struct TrustConfig {
    #[serde(default, rename = "TrustKeysFrom")]
    /// CIDR rules: an unknown key is TOFU-installed only if the peer
    /// address matches one of these networks.
    pub trust_keys_from: Vec<ipnet::IpNet>,

    #[serde(default, rename = "Strict")]
    /// When set, a known key with a changed address is rejected instead of
    /// updated.
    pub strict: YesNo,

    #[serde(rename = "KeyringDirectory")]
    /// Directory holding this host's own key pair and trusted peer keys.
    pub keyring_directory: String,

    #[serde(default = "default_digest_method", rename = "DigestMethod")]
    /// Digest method used for newly constructed fingerprints.
    pub digest_method: DigestMethod,
}

fn default_digest_method() -> DigestMethod {
    DigestMethod::Sha256
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// On-disk layout (§4.3, §4.8).
pub struct PathsConfig {
    #[serde(rename = "StateDirectory")]
    /// Directory holding the lastseen KV store and the repair-trigger
    /// marker.
    pub state_directory: String,

    #[serde(rename = "PolicyRoot")]
    /// Root of the access-control policy tree consulted by C7.
    pub policy_root: String,

    #[serde(default = "default_repair_trigger_name", rename = "RepairTriggerFile")]
    /// Marker filename under `StateDirectory` (§4.3, §6).
    pub repair_trigger_file: String,
}

fn default_repair_trigger_name() -> String {
    crate::store::REPAIR_TRIGGER_FILE.to_string()
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.listener.max_connections >= 1, "MaxConnections must be >= 1");
        ensure!(self.listener.backlog >= 1, "Backlog must be >= 1");
        ensure!(
            !self.trust.keyring_directory.is_empty(),
            "KeyringDirectory must not be empty"
        );
        ensure!(!self.paths.state_directory.is_empty(), "StateDirectory must not be empty");
        ensure!(!self.paths.policy_root.is_empty(), "PolicyRoot must not be empty");

        if self.listener.idle_sweep_age < self.listener.idle_timeout {
            // A sweep age shorter than the per-connection idle timeout
            // would reap live connections; raise it to match.
            self.listener.idle_sweep_age = self.listener.idle_timeout;
        }

        Ok(())
    }
}

mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for YesNo {
    fn default() -> Self {
        YesNo::No
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_loads_with_defaults() {
        let yaml = r#"
listener:
  BindAddress: "0.0.0.0:5308"
trust:
  KeyringDirectory: "/var/lib/cfnet/keys"
paths:
  StateDirectory: "/var/lib/cfnet/state"
  PolicyRoot: "/var/lib/cfnet/policy"
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.listener.backlog, 128);
        assert_eq!(cfg.listener.max_connections, 256);
        assert!(!cfg.listener.legacy_protocol.as_bool());
    }

    #[test]
    fn sweep_age_is_raised_to_match_idle_timeout() {
        let yaml = r#"
listener:
  BindAddress: "0.0.0.0:5308"
  IdleTimeout: 600
  IdleSweepAge: 60
trust:
  KeyringDirectory: "/var/lib/cfnet/keys"
paths:
  StateDirectory: "/var/lib/cfnet/state"
  PolicyRoot: "/var/lib/cfnet/policy"
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.listener.idle_sweep_age, Duration::from_secs(600));
    }

    #[test]
    fn empty_keyring_directory_is_rejected() {
        let yaml = r#"
listener:
  BindAddress: "0.0.0.0:5308"
trust:
  KeyringDirectory: ""
paths:
  StateDirectory: "/var/lib/cfnet/state"
  PolicyRoot: "/var/lib/cfnet/policy"
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(cfg.validate_and_normalize().is_err());
    }
}
