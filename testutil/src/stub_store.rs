// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;
use store::{ByteStoreProvider, StoreError};

use crate::data::{TestData, TestDirectory, TestTree};

///
/// An in-memory `ByteStoreProvider` which backs the test suites: preloaded blobs, a
/// per-digest request count, and per-digest failure injection.
///
/// Injected failures are held (and returned) as shared `Arc` instances, so a test can make
/// several digests fail with literally the same error value and assert on identity
/// deduplication downstream.
///
#[derive(Clone)]
pub struct StubStore {
    pub blobs: Arc<Mutex<HashMap<Fingerprint, Bytes>>>,
    errors: Arc<Mutex<HashMap<Fingerprint, Arc<StoreError>>>>,
    request_counts: Arc<Mutex<HashMap<Fingerprint, usize>>>,
    always_errors: bool,
}

pub struct StubStoreBuilder {
    content: HashMap<Fingerprint, Bytes>,
    errors: HashMap<Fingerprint, Arc<StoreError>>,
    always_errors: bool,
}

impl StubStoreBuilder {
    pub fn new() -> StubStoreBuilder {
        StubStoreBuilder {
            content: HashMap::new(),
            errors: HashMap::new(),
            always_errors: false,
        }
    }

    pub fn file(mut self, file: &TestData) -> StubStoreBuilder {
        self.content.insert(file.fingerprint(), file.bytes());
        self
    }

    pub fn directory(mut self, directory: &TestDirectory) -> StubStoreBuilder {
        self.content
            .insert(directory.fingerprint(), directory.bytes());
        self
    }

    pub fn tree(mut self, tree: &TestTree) -> StubStoreBuilder {
        self.content.insert(tree.fingerprint(), tree.bytes());
        self
    }

    pub fn unverified_content(mut self, fingerprint: Fingerprint, content: Bytes) -> StubStoreBuilder {
        self.content.insert(fingerprint, content);
        self
    }

    /// Fail every fetch of `digest` with the given (shared) error instance.
    pub fn error_for(mut self, digest: Digest, error: Arc<StoreError>) -> StubStoreBuilder {
        self.errors.insert(digest.hash, error);
        self
    }

    pub fn always_errors(mut self) -> StubStoreBuilder {
        self.always_errors = true;
        self
    }

    pub fn build(self) -> StubStore {
        StubStore {
            blobs: Arc::new(Mutex::new(self.content)),
            errors: Arc::new(Mutex::new(self.errors)),
            request_counts: Arc::new(Mutex::new(HashMap::new())),
            always_errors: self.always_errors,
        }
    }
}

impl StubStore {
    pub fn builder() -> StubStoreBuilder {
        StubStoreBuilder::new()
    }

    pub fn empty() -> StubStore {
        StubStore::builder().build()
    }

    /// The number of fetches this provider has seen for `digest`.
    pub fn request_count(&self, digest: Digest) -> usize {
        *self.request_counts.lock().get(&digest.hash).unwrap_or(&0)
    }

    pub fn remove(&self, fingerprint: Fingerprint) -> bool {
        self.blobs.lock().remove(&fingerprint).is_some()
    }
}

#[async_trait]
impl ByteStoreProvider for StubStore {
    async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, Arc<StoreError>> {
        *self.request_counts.lock().entry(digest.hash).or_insert(0) += 1;
        if self.always_errors {
            return Err(Arc::new(StoreError::Unclassified(
                "StubStore is configured to always fail".to_owned(),
            )));
        }
        if let Some(err) = self.errors.lock().get(&digest.hash) {
            return Err(err.clone());
        }
        Ok(self.blobs.lock().get(&digest.hash).cloned())
    }
}
