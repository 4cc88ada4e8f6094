// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{Digest, Fingerprint, EMPTY_FINGERPRINT, FINGERPRINT_SIZE};
use serde_test::{assert_tokens, Token};

#[test]
fn hex_round_trip() {
    let fingerprint = Digest::of_bytes(b"ore levels nominal").hash;
    let hex = fingerprint.to_hex();
    assert_eq!(hex.len(), FINGERPRINT_SIZE * 2);
    assert_eq!(Fingerprint::from_hex_string(&hex).unwrap(), fingerprint);
}

#[test]
fn hex_parsing_accepts_uppercase() {
    let fingerprint = Digest::of_bytes(b"drill log").hash;
    let upper = fingerprint.to_hex().to_uppercase();
    assert_eq!(Fingerprint::from_hex_string(&upper).unwrap(), fingerprint);
}

#[test]
fn rejects_hex_of_the_wrong_length() {
    Fingerprint::from_hex_string("abcd").expect_err("Want err");

    let mut too_long = EMPTY_FINGERPRINT.to_hex();
    too_long.push_str("00");
    Fingerprint::from_hex_string(&too_long).expect_err("Want err");
}

#[test]
fn rejects_non_hex_characters() {
    let bad = "zz".repeat(FINGERPRINT_SIZE);
    Fingerprint::from_hex_string(&bad).expect_err("Want err");
}

#[test]
fn display_renders_lowercase_hex() {
    assert_eq!(
        EMPTY_FINGERPRINT.to_string(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn serializes_as_a_hex_string() {
    // SHA-256 of "abc", a fixed point to pin the serialized form against.
    let fingerprint = Digest::of_bytes(b"abc").hash;
    assert_tokens(
        &fingerprint,
        &[Token::Str(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )],
    );
}
