// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use digest::consts::U32;
use generic_array::GenericArray;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

/// The SHA-256 of the empty byte string. A legal content address wherever one is accepted.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, //
    0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24, //
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, //
    0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

/// A SHA-256 hash, rendered as lowercase hex on the wire and in logs.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes(bytes: GenericArray<u8, U32>) -> Fingerprint {
        Fingerprint(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string)
            .map_err(|e| format!("Invalid hex fingerprint {hex_string:?}: {e}"))?;
        if bytes.len() != FINGERPRINT_SIZE {
            return Err(format!(
                "Fingerprints are {FINGERPRINT_SIZE} bytes, but {hex_string:?} decodes to {}.",
                bytes.len()
            ));
        }
        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(&bytes);
        Ok(Fingerprint(fingerprint))
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fingerprint").field(&self.to_hex()).finish()
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_string = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&hex_string).map_err(serde::de::Error::custom)
    }
}

/// A content address: the fingerprint of a blob plus its size in bytes.
///
/// Equality is over both fields. The size rides along so that consumers can plan transfers
/// and verify lengths without holding the bytes; it is the same pairing the Remote
/// Execution API uses for its wire `Digest`, minus the protobuf.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    #[serde(rename = "fingerprint")]
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Digest::new(Fingerprint::from_bytes(Sha256::digest(bytes)), bytes.len())
    }
}

#[cfg(test)]
mod fingerprint_tests;
