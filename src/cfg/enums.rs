// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support. Used for the
/// handful of config knobs that read more naturally as a toggle word than
/// `true`/`false` in the YAML document.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Key digest method, mirroring [`crate::key::DigestMethod`] but kept as its
/// own config-facing enum so the wire/storage type and the config schema can
/// evolve independently.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMethod {
    #[serde(rename = "sha256", alias = "SHA256", alias = "SHA-256")]
    Sha256,
    #[serde(rename = "sha512", alias = "SHA512", alias = "SHA-512")]
    Sha512,
}
impl fmt::Display for DigestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestMethod::Sha256 => "sha256",
            DigestMethod::Sha512 => "sha512",
        })
    }
}
impl From<DigestMethod> for crate::key::DigestMethod {
    fn from(d: DigestMethod) -> Self {
        match d {
            DigestMethod::Sha256 => crate::key::DigestMethod::Sha256,
            DigestMethod::Sha512 => crate::key::DigestMethod::Sha512,
        }
    }
}
