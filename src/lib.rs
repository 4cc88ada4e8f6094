// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The client side of remote execution: given the server's `ActionResult` manifest for a
//! spawn, reconstruct the action's declared outputs under the local execution root, or,
//! depending on the configured materialization mode, register remote-file metadata with the
//! build graph instead of downloading bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use hashing::Digest;
use protos::remexec;
use store::{ByteStore, StoreError};
use task_executor::Executor;

mod download;
mod inject;
mod plan;

pub use crate::plan::{
    DownloadPlan, FileDownload, InjectFile, InjectTree, InlineOutput, OutputPathResolver,
    OutputPathsLayout, PlannedSymlink, StdioSource, SymlinkKind, TreeDownload,
};

#[cfg(test)]
mod plan_tests;


/// Execution-info key naming a single output path whose bytes should be returned in memory
/// rather than materialized on disk.
pub const REMOTE_EXECUTION_INLINE_OUTPUTS: &str = "REMOTE_EXECUTION_INLINE_OUTPUTS";

/// Version stamp on injected metadata records, for downstream consumers which need to
/// locate the bytes behind a record.
pub const REMOTE_FILE_LOCATOR_VERSION: u32 = 1;

/// Which outputs of a remote action are downloaded to disk, as opposed to being registered
/// with the build graph as remote-file metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RemoteOutputsMode {
    /// Download every output.
    All,
    /// Download only the outputs configured as top-level outputs of the build; inject
    /// metadata for the rest.
    TopLevel,
    /// Inject metadata for every output.
    Minimal,
}

///
/// A locally-described build action whose outputs may be produced by a remote cache or
/// execution cluster.
///
#[derive(Clone, Debug)]
pub struct Spawn {
    pub description: String,
    /// Declared file outputs, as wire paths.
    pub output_files: BTreeSet<PathBuf>,
    /// Declared directory outputs, as wire paths.
    pub output_directories: BTreeSet<PathBuf>,
    /// Per-spawn execution metadata, e.g. `REMOTE_EXECUTION_INLINE_OUTPUTS`.
    pub execution_info: BTreeMap<String, String>,
}

///
/// The stdout/stderr sinks of one spawn. The paths stay valid for writing for the lifetime
/// of the spawn, whether or not output materialization succeeds.
///
#[derive(Clone, Debug)]
pub struct OutErr {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl OutErr {
    pub fn new(stdout_path: PathBuf, stderr_path: PathBuf) -> OutErr {
        OutErr {
            stdout_path,
            stderr_path,
        }
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// Remove any previously written stream files.
    pub fn clear(&self) -> Result<(), String> {
        for path in [&self.stdout_path, &self.stderr_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(format!("Failed to clear stream at {path:?}: {e}")),
            }
        }
        Ok(())
    }

    pub fn write_stdout(&self, bytes: &[u8]) -> Result<(), String> {
        write_stream(&self.stdout_path, bytes)
    }

    pub fn write_stderr(&self, bytes: &[u8]) -> Result<(), String> {
        write_stream(&self.stderr_path, bytes)
    }
}

fn write_stream(path: &Path, bytes: &[u8]) -> Result<(), String> {
    std::fs::write(path, bytes).map_err(|e| format!("Failed to write stream at {path:?}: {e}"))
}

///
/// The per-spawn collaborator surface the surrounding build supplies: where outputs land,
/// where the child's streams go, and the advisory claim taken when materialization
/// completes.
///
pub trait SpawnExecutionContext: Send + Sync {
    /// The directory under which this spawn's outputs are materialized.
    fn exec_root(&self) -> &Path;

    /// The stdout/stderr sinks for the spawn.
    fn out_err(&self) -> OutErr;

    /// Assert the per-action claim that output materialization completed successfully.
    fn lock_output_files(&self) -> Result<(), String>;
}

/// Metadata registered with the build graph in lieu of a downloaded file. The size of the
/// bytes travels with the digest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFileMetadata {
    pub digest: Digest,
    pub locator_version: u32,
    /// The id of the action which produced the file remotely.
    pub action_id: String,
}

/// Metadata for a whole tree output: every file in the expanded tree, keyed by path
/// relative to the tree root.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteTreeMetadata {
    pub children: BTreeMap<PathBuf, RemoteFileMetadata>,
}

///
/// The build graph's metadata store, as consumed by this crate. Implementations must accept
/// calls for one action strictly after that action's downloads have settled (which this
/// crate guarantees), so per-action calls are serialized.
///
pub trait MetadataInjector: Send + Sync {
    fn inject_file(&self, wire_path: &Path, metadata: RemoteFileMetadata);

    fn inject_tree(&self, wire_path: &Path, tree: RemoteTreeMetadata);
}

/// An output returned in memory rather than written under the execution root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InMemoryOutput {
    /// The wire path of the declared output.
    pub path: PathBuf,
    pub contents: Bytes,
}

///
/// A spawn bound to the context it runs under, created at spawn submission and immutable
/// thereafter. The `action_id` stamps injected metadata so downstream consumers can tie a
/// remote file back to the producing action.
///
#[derive(Clone)]
pub struct RemoteAction {
    action_id: String,
    spawn: Spawn,
    exec_root: PathBuf,
    context: Arc<dyn SpawnExecutionContext>,
}

impl RemoteAction {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn spawn(&self) -> &Spawn {
        &self.spawn
    }

    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    pub fn context(&self) -> &dyn SpawnExecutionContext {
        self.context.as_ref()
    }
}

impl fmt::Debug for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAction")
            .field("action_id", &self.action_id)
            .field("exec_root", &self.exec_root)
            .finish_non_exhaustive()
    }
}

///
/// The aggregate of every fetch failure in one materialization pass: one primary cause,
/// with the remaining causes attached as suppressed. Suppression deduplicates by `Arc`
/// identity, so one underlying failure shared by several fetch requests is reported once.
///
#[derive(Debug)]
pub struct BulkTransferError {
    primary: Arc<StoreError>,
    suppressed: Vec<Arc<StoreError>>,
}

impl BulkTransferError {
    pub fn new(primary: Arc<StoreError>) -> BulkTransferError {
        BulkTransferError {
            primary,
            suppressed: Vec::new(),
        }
    }

    /// Attach a further cause, unless it is the same instance as one already held.
    pub fn attach(&mut self, err: Arc<StoreError>) {
        if Arc::ptr_eq(&self.primary, &err)
            || self.suppressed.iter().any(|held| Arc::ptr_eq(held, &err))
        {
            return;
        }
        self.suppressed.push(err);
    }

    pub fn primary(&self) -> &StoreError {
        &self.primary
    }

    pub fn suppressed(&self) -> &[Arc<StoreError>] {
        &self.suppressed
    }
}

impl fmt::Display for BulkTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to download outputs: {}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (and {} further failures)", self.suppressed.len())?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum MaterializeError {
    /// An output path was ill-formed, escaped the execution root, or collided with another
    /// output's path. Raised before any I/O.
    InvalidOutputPath { path: String, reason: String },
    /// An output symlink had an absolute target. Raised before any byte is fetched.
    AbsoluteSymlinkTarget { path: String, target: String },
    /// A `Tree` manifest did not decode, or referenced a child `Directory` it did not
    /// contain.
    MalformedTree { digest: Digest, message: String },
    /// One or more fetches failed; every cause is attached.
    BulkTransfer(BulkTransferError),
    /// The action was interrupted. Reported once, however many fetches observed it.
    Interrupted,
    Unclassified(String),
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::InvalidOutputPath { path, reason } => {
                write!(f, "Invalid output path {path:?}: {reason}")
            }
            MaterializeError::AbsoluteSymlinkTarget { path, target } => {
                write!(
                    f,
                    "Output symlink {path} has an absolute target {target}: only relative \
                     symlink targets are supported."
                )
            }
            MaterializeError::MalformedTree { digest, message } => {
                write!(f, "Malformed Tree manifest {digest:?}: {message}")
            }
            MaterializeError::BulkTransfer(err) => write!(f, "{err}"),
            MaterializeError::Interrupted => write!(f, "Output download was interrupted"),
            MaterializeError::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for MaterializeError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

pub struct RemoteExecutionServiceOptions {
    pub outputs_mode: RemoteOutputsMode,
    /// Wire paths of the outputs considered top-level by the build. Consulted only in
    /// `TopLevel` mode.
    pub top_level_outputs: BTreeSet<PathBuf>,
    pub layout: OutputPathsLayout,
    /// The number of blob fetches driven concurrently per action.
    pub fetch_concurrency: usize,
}

impl Default for RemoteExecutionServiceOptions {
    fn default() -> Self {
        Self {
            outputs_mode: RemoteOutputsMode::All,
            top_level_outputs: BTreeSet::new(),
            layout: OutputPathsLayout::ExecRootRelative,
            fetch_concurrency: 16,
        }
    }
}

///
/// The facade of the remote execution client: binds spawns to `RemoteAction`s, and
/// materializes `ActionResult`s by composing the output planner, the download
/// orchestrator, and the metadata injector adapter.
///
#[derive(Clone)]
pub struct RemoteExecutionService {
    store: ByteStore,
    executor: Executor,
    injector: Arc<dyn MetadataInjector>,
    options: Arc<RemoteExecutionServiceOptions>,
}

impl RemoteExecutionService {
    pub fn new(
        store: ByteStore,
        executor: Executor,
        injector: Arc<dyn MetadataInjector>,
        options: RemoteExecutionServiceOptions,
    ) -> RemoteExecutionService {
        RemoteExecutionService {
            store,
            executor,
            injector,
            options: Arc::new(options),
        }
    }

    pub fn store(&self) -> &ByteStore {
        &self.store
    }

    /// Bind a spawn to the context it will run under. Pure.
    pub fn build_remote_action(
        &self,
        spawn: Spawn,
        context: Arc<dyn SpawnExecutionContext>,
    ) -> RemoteAction {
        let action_id = action_id_for(&spawn);
        let exec_root = context.exec_root().to_path_buf();
        RemoteAction {
            action_id,
            spawn,
            exec_root,
            context,
        }
    }

    ///
    /// Materialize the outputs described by `result` under the action's execution root,
    /// per the configured materialization mode.
    ///
    /// The output-tree lock is acquired via the spawn context iff this returns `Ok`. On
    /// failure, in-flight file writes are erased by their staging layer, already-created
    /// tree root directories are retained, and the child's stdout/stderr sinks remain
    /// writable.
    ///
    pub async fn download_outputs(
        &self,
        action: &RemoteAction,
        result: &remexec::ActionResult,
    ) -> Result<Option<InMemoryOutput>, MaterializeError> {
        let resolver = OutputPathResolver::new(action.exec_root().to_path_buf(), self.options.layout);
        let plan = plan::plan_outputs(action.spawn(), result, &self.options, &resolver)?;
        log::debug!(
            "Downloading outputs for {}: {} files, {} trees, {} symlinks, {} metadata-only",
            action.spawn().description,
            plan.file_downloads.len(),
            plan.tree_downloads.len(),
            plan.symlinks.len(),
            plan.inject_files.len() + plan.inject_trees.len(),
        );

        let out_err = action.context().out_err();
        out_err.clear().map_err(MaterializeError::Unclassified)?;

        let downloaded = download::execute(
            &self.store,
            &self.executor,
            self.options.fetch_concurrency,
            &plan,
        )
        .await?;

        if let Some(stdout) = &downloaded.stdout {
            out_err
                .write_stdout(stdout)
                .map_err(MaterializeError::Unclassified)?;
        }
        if let Some(stderr) = &downloaded.stderr {
            out_err
                .write_stderr(stderr)
                .map_err(MaterializeError::Unclassified)?;
        }

        action
            .context()
            .lock_output_files()
            .map_err(MaterializeError::Unclassified)?;
        log::debug!("Downloaded outputs for {}", action.spawn().description);

        inject::inject_metadata(action, &plan, &downloaded, self.injector.as_ref())
    }
}

/// A deterministic id for the action: the fingerprint of its description and declared
/// outputs.
fn action_id_for(spawn: &Spawn) -> String {
    let mut buf = String::new();
    buf.push_str(&spawn.description);
    for path in &spawn.output_files {
        buf.push('\u{0}');
        buf.push('f');
        buf.push_str(&path.to_string_lossy());
    }
    for path in &spawn.output_directories {
        buf.push('\u{0}');
        buf.push('d');
        buf.push_str(&path.to_string_lossy());
    }
    Digest::of_bytes(buf.as_bytes()).hash.to_hex()
}
