// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(unused_must_use)]
// Hand-declared prost messages hit this the same way generated ones do:
// see https://github.com/hyperium/tonic/issues/1056
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod remexec;

mod conversions;
pub use conversions::require_digest;


mod message;
pub use message::MessageExt;
