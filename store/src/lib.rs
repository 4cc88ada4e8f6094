// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashing::{Digest, EMPTY_DIGEST};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

#[derive(Debug)]
pub enum StoreError {
    /// The blob was not present in the store.
    MissingDigest(Digest),
    /// The fetch was cancelled before it completed.
    Interrupted,
    /// A transport or provider failure.
    Unclassified(String),
}

impl StoreError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, StoreError::Interrupted)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::MissingDigest(d) => {
                write!(f, "Missing digest: {:?}", d)
            }
            StoreError::Interrupted => write!(f, "Fetch was interrupted"),
            StoreError::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

///
/// A pluggable source of blob bytes, addressed by `Digest`. `Ok(None)` indicates that the
/// blob is not present.
///
/// Errors are returned as shared instances: a provider for which one underlying failure
/// backs several logical requests should hand out clones of a single `Arc`, so that callers
/// aggregating errors can deduplicate by identity.
///
#[async_trait]
pub trait ByteStoreProvider: Send + Sync + 'static {
    async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, Arc<StoreError>>;
}

type FetchFuture = Shared<BoxFuture<'static, Result<Bytes, Arc<StoreError>>>>;

///
/// A client for an abstract content-addressed byte store.
///
/// Fetches are coalesced per digest with one atomic get-or-insert into a mutex-guarded map
/// of shared futures: concurrent and repeated requests for one digest subscribe to a single
/// provider call, so within the lifetime of this client a blob is fetched from the provider
/// at most once. Completed entries are retained, which also makes the client a small
/// in-memory blob cache for the action it serves.
///
#[derive(Clone)]
pub struct ByteStore {
    provider: Arc<dyn ByteStoreProvider>,
    fetches: Arc<Mutex<HashMap<Digest, FetchFuture>>>,
    fetches_succeeded: Arc<AtomicUsize>,
    fetches_failed: Arc<AtomicUsize>,
}

impl fmt::Debug for ByteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStore").finish_non_exhaustive()
    }
}

impl ByteStore {
    pub fn new(provider: impl ByteStoreProvider) -> ByteStore {
        ByteStore {
            provider: Arc::new(provider),
            fetches: Arc::new(Mutex::new(HashMap::new())),
            fetches_succeeded: Arc::new(AtomicUsize::new(0)),
            fetches_failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    ///
    /// Load the bytes of the blob with the passed digest, subscribing to an existing
    /// in-flight (or completed) fetch if there is one.
    ///
    /// A failed fetch yields the same `Arc`'d error instance for every subscriber.
    ///
    pub async fn load_bytes(&self, digest: Digest) -> Result<Bytes, Arc<StoreError>> {
        // The empty blob is a legal identity, and needs no transport.
        if digest == EMPTY_DIGEST {
            return Ok(Bytes::new());
        }

        let fetch = {
            let mut fetches = self.fetches.lock();
            fetches
                .entry(digest)
                .or_insert_with(|| {
                    let provider = self.provider.clone();
                    let succeeded = self.fetches_succeeded.clone();
                    let failed = self.fetches_failed.clone();
                    async move {
                        log::trace!("ByteStore::load_bytes({digest:?})");
                        let result = match provider.load_bytes(digest).await {
                            Ok(Some(bytes)) => Ok(bytes),
                            Ok(None) => Err(Arc::new(StoreError::MissingDigest(digest))),
                            Err(err) => Err(err),
                        };
                        match &result {
                            Ok(_) => succeeded.fetch_add(1, Ordering::SeqCst),
                            Err(_) => failed.fetch_add(1, Ordering::SeqCst),
                        };
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        fetch.await
    }

    /// The number of provider fetches which have succeeded. Coalesced requests count once.
    pub fn fetches_succeeded(&self) -> usize {
        self.fetches_succeeded.load(Ordering::SeqCst)
    }

    /// The number of provider fetches which have failed. Coalesced requests count once.
    pub fn fetches_failed(&self) -> usize {
        self.fetches_failed.load(Ordering::SeqCst)
    }
}

///
/// A file whose bytes have been written to a temporary sibling of its final destination,
/// with the executable bit already applied.
///
/// `commit` renames the file into place; dropping an uncommitted `StagedFile` removes the
/// temporary file, so an abandoned or failed materialization never leaves a half-written
/// file (or any file at all) at the destination.
///
pub struct StagedFile {
    tmp: NamedTempFile,
    destination: PathBuf,
}

impl StagedFile {
    ///
    /// Write `bytes` to a temporary file in the destination's parent directory. Blocking:
    /// callers on an async runtime should run this on a blocking-friendly thread.
    ///
    pub fn stage(destination: &Path, bytes: &[u8], is_executable: bool) -> Result<StagedFile, String> {
        let parent = destination
            .parent()
            .ok_or_else(|| format!("Output path {destination:?} has no parent directory."))?;
        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|e| format!("Failed to create temporary file in {parent:?}: {e}"))?;
        tmp.write_all(bytes)
            .map_err(|e| format!("Failed to write {destination:?}: {e}"))?;
        tmp.flush()
            .map_err(|e| format!("Failed to flush {destination:?}: {e}"))?;

        let mode = if is_executable { 0o755 } else { 0o644 };
        let permissions = std::fs::Permissions::from_mode(mode);
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(|e| format!("Failed to set permissions on {destination:?}: {e}"))?;

        Ok(StagedFile {
            tmp,
            destination: destination.to_path_buf(),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Rename the staged file into its final destination.
    pub fn commit(self) -> Result<(), String> {
        self.tmp
            .persist(&self.destination)
            .map(|_| ())
            .map_err(|e| {
                format!(
                    "Failed to move output into place at {:?}: {}",
                    self.destination, e.error
                )
            })
    }
}
