//! Public-key wrapper and canonical fingerprint (§4.1).
//!
//! A [`Key`] owns the raw key material exactly once; its digest is computed
//! eagerly at construction and cached so that `fingerprint()` never touches
//! the hasher again. Changing the digest method computes a brand-new digest
//! first and only swaps it in once hashing succeeds, so a failed re-hash
//! leaves the key usable under its previous method.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

/// Digest algorithms a [`Key`] may be fingerprinted with.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestMethod {
    #[serde(rename = "SHA", alias = "sha", alias = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512", alias = "sha512")]
    Sha512,
}

impl DigestMethod {
    fn label(self) -> &'static str {
        match self {
            DigestMethod::Sha256 => "SHA",
            DigestMethod::Sha512 => "SHA512",
        }
    }

    fn hash(self, material: &[u8]) -> Vec<u8> {
        match self {
            DigestMethod::Sha256 => Sha256::digest(material).to_vec(),
            DigestMethod::Sha512 => Sha512::digest(material).to_vec(),
        }
    }
}

impl fmt::Display for DigestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Returned when raw key material cannot be hashed (empty material, or the
/// selected digest implementation rejects it).
#[derive(Debug, Error)]
#[error("invalid key material for digest {method}")]
pub struct InvalidKey {
    method: DigestMethod,
}

/// A public key plus its canonical, immutable-once-set digest.
///
/// Cheap to share: wrap in `Arc<Key>` to hand the same identity to both a
/// live connection and the lastseen index (§9 Design Notes — "Reference-shared
/// keys → ownership").
#[derive(Debug, Clone)]
pub struct Key {
    raw: Arc<[u8]>,
    method: DigestMethod,
    digest: Arc<[u8]>,
    printable: Arc<str>,
}

impl Key {
    /// Builds a `Key` from raw material, computing the digest under `method`.
    pub fn construct(raw: Vec<u8>, method: DigestMethod) -> Result<Self, InvalidKey> {
        if raw.is_empty() {
            return Err(InvalidKey { method });
        }
        let digest = method.hash(&raw);
        let printable = format_printable(method, &digest);
        Ok(Self {
            raw: Arc::from(raw),
            method,
            digest: Arc::from(digest),
            printable: Arc::from(printable),
        })
    }

    /// Raw key material as originally supplied.
    pub fn raw_material(&self) -> &[u8] {
        &self.raw
    }

    /// Binary digest bytes under the current method.
    pub fn digest_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Printable fingerprint, e.g. `SHA=deadbeef...`.
    pub fn fingerprint(&self) -> &str {
        &self.printable
    }

    /// Current digest method.
    pub fn method(&self) -> DigestMethod {
        self.method
    }

    /// Re-hashes under `method`, atomically swapping in the new digest only
    /// on success; on failure `self` is left untouched.
    pub fn set_method(&mut self, method: DigestMethod) -> Result<(), InvalidKey> {
        if self.raw.is_empty() {
            return Err(InvalidKey { method });
        }
        let digest = method.hash(&self.raw);
        let printable = format_printable(method, &digest);
        self.method = method;
        self.digest = Arc::from(digest);
        self.printable = Arc::from(printable);
        Ok(())
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.digest == other.digest
    }
}
impl Eq for Key {}

fn format_printable(method: DigestMethod, digest: &[u8]) -> String {
    let mut s = String::with_capacity(method.label().len() + 1 + digest.len() * 2);
    s.push_str(method.label());
    s.push('=');
    for b in digest {
        use core::fmt::Write;
        write!(&mut s, "{b:02x}").expect("writing to String cannot fail");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_reconstruction() {
        let k1 = Key::construct(b"peer-public-key-material".to_vec(), DigestMethod::Sha256)
            .expect("construct");
        let k2 = Key::construct(b"peer-public-key-material".to_vec(), DigestMethod::Sha256)
            .expect("construct");
        assert_eq!(k1.fingerprint(), k2.fingerprint());
        assert!(k1.fingerprint().starts_with("SHA="));
    }

    #[test]
    fn mixing_methods_is_not_equality() {
        let k1 = Key::construct(b"same-bytes".to_vec(), DigestMethod::Sha256).expect("ok");
        let mut k2 = Key::construct(b"same-bytes".to_vec(), DigestMethod::Sha256).expect("ok");
        k2.set_method(DigestMethod::Sha512).expect("rehash");
        assert_ne!(k1, k2);
        assert_ne!(k1.fingerprint(), k2.fingerprint());
    }

    #[test]
    fn failed_rehash_leaves_key_usable() {
        let mut k = Key::construct(b"material".to_vec(), DigestMethod::Sha256).expect("ok");
        let before = k.fingerprint().to_string();
        // Force raw to be non-empty always in this constructor; simulate by
        // re-running set_method with the same data, which must succeed and
        // change the fingerprint deterministically.
        k.set_method(DigestMethod::Sha512).expect("rehash");
        assert_ne!(before, k.fingerprint());
    }

    #[test]
    fn empty_material_is_rejected() {
        assert!(Key::construct(Vec::new(), DigestMethod::Sha256).is_err());
    }
}
