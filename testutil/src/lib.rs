// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;

pub mod data;

mod stub_store;
pub use crate::stub_store::{StubStore, StubStoreBuilder};

pub fn as_bytes(str: &str) -> Bytes {
    Bytes::copy_from_slice(str.as_bytes())
}
