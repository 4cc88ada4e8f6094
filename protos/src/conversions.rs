// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::remexec;

impl From<hashing::Digest> for remexec::Digest {
    fn from(d: hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl<'a> From<&'a hashing::Digest> for remexec::Digest {
    fn from(d: &'a hashing::Digest) -> Self {
        (*d).into()
    }
}

impl<'a> TryFrom<&'a remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: &remexec::Digest) -> Result<Self, Self::Error> {
        let fingerprint = hashing::Fingerprint::from_hex_string(&d.hash)
            .map_err(|err| format!("Bad fingerprint in Digest {:?}: {err}", d.hash))?;
        Ok(hashing::Digest::new(fingerprint, d.size_bytes as usize))
    }
}

impl TryFrom<remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: remexec::Digest) -> Result<Self, Self::Error> {
        (&d).try_into()
    }
}

/// Unwrap an optional wire `Digest`, failing when a message omitted a field the Remote
/// Execution API requires.
pub fn require_digest<'a, D: Into<Option<&'a remexec::Digest>>>(
    digest_opt: D,
) -> Result<hashing::Digest, String> {
    match digest_opt.into() {
        Some(digest) => hashing::Digest::try_from(digest),
        None => Err("Required Digest missing from a Remote Execution API message.".into()),
    }
}
