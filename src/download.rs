// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use fs::TreeContents;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use hashing::Digest;
use prost::Message;
use protos::remexec;
use store::{ByteStore, StagedFile, StoreError};
use task_executor::Executor;

use crate::plan::{DownloadPlan, FileDownload, StdioSource, TreeDownload};
use crate::{BulkTransferError, MaterializeError};

/// Everything the orchestrator hands back on success: the fetched stream bytes, the inline
/// output's bytes, and the expanded contents of inject-only trees (fetched and validated
/// here, so the injection post-pass issues no I/O and cannot fail on a malformed manifest
/// after the output-tree lock is taken).
pub(crate) struct DownloadedOutputs {
    pub stdout: Option<Bytes>,
    pub stderr: Option<Bytes>,
    pub inline_contents: Option<Bytes>,
    pub tree_contents: HashMap<Digest, TreeContents>,
}

enum Fetched {
    /// Staged files plus the symlinks discovered inside a tree, to apply in the commit
    /// phase.
    Files {
        staged: Vec<StagedFile>,
        symlinks: Vec<(PathBuf, PathBuf)>,
    },
    Stdout(Bytes),
    Stderr(Bytes),
    Inline(Bytes),
    TreeContents(Digest, TreeContents),
}

enum DownloadFailure {
    Store(Arc<StoreError>),
    MalformedTree { digest: Digest, message: String },
}

type FetchResult = Result<Fetched, Vec<DownloadFailure>>;

///
/// Execute a `DownloadPlan`: launch every fetch, wait for all of them to settle, and only
/// then either commit the staged filesystem state or aggregate every failure.
///
/// Failure handling:
/// * staged files are dropped, which erases their temporary siblings: a failed action
///   leaves no partially- or even fully-downloaded files at their destinations;
/// * tree root directories that were already created are retained;
/// * an interruption wins over everything else and is reported once;
/// * remaining failures aggregate into a `BulkTransferError`, deduplicated by instance
///   identity.
///
pub(crate) async fn execute(
    store: &ByteStore,
    executor: &Executor,
    concurrency: usize,
    plan: &DownloadPlan,
) -> Result<DownloadedOutputs, MaterializeError> {
    let mut units: Vec<BoxFuture<'_, FetchResult>> = Vec::new();

    for file in &plan.file_downloads {
        units.push(fetch_file(store, executor, file).boxed());
    }
    for tree in &plan.tree_downloads {
        units.push(fetch_tree(store, executor, tree).boxed());
    }
    for inject_tree in &plan.inject_trees {
        let digest = inject_tree.tree_digest;
        units.push(
            async move {
                let manifest = load_tree_manifest(store, digest)
                    .await
                    .map_err(|failure| vec![failure])?;
                let contents = TreeContents::expand(&manifest).map_err(|message| {
                    vec![DownloadFailure::MalformedTree { digest, message }]
                })?;
                Ok(Fetched::TreeContents(digest, contents))
            }
            .boxed(),
        );
    }
    if let Some(inline) = &plan.inline_output {
        let digest = inline.digest;
        units.push(
            async move {
                let bytes = store
                    .load_bytes(digest)
                    .await
                    .map_err(|e| vec![DownloadFailure::Store(e)])?;
                Ok(Fetched::Inline(bytes))
            }
            .boxed(),
        );
    }
    if let Some(unit) = stdio_unit(store, &plan.stdout, Fetched::Stdout) {
        units.push(unit);
    }
    if let Some(unit) = stdio_unit(store, &plan.stderr, Fetched::Stderr) {
        units.push(unit);
    }

    // Join phase: every launched fetch settles before this returns, so cleanup can never
    // race outstanding work.
    let outcomes: Vec<FetchResult> = stream::iter(units)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut staged_files: Vec<StagedFile> = Vec::new();
    let mut symlinks: Vec<(PathBuf, PathBuf)> = plan
        .symlinks
        .iter()
        .map(|s| (s.path.clone(), s.target.clone()))
        .collect();
    let mut outputs = DownloadedOutputs {
        stdout: None,
        stderr: None,
        inline_contents: None,
        tree_contents: HashMap::new(),
    };
    let mut failures: Vec<DownloadFailure> = Vec::new();

    for outcome in outcomes {
        match outcome {
            Ok(Fetched::Files {
                staged,
                symlinks: tree_symlinks,
            }) => {
                staged_files.extend(staged);
                symlinks.extend(tree_symlinks);
            }
            Ok(Fetched::Stdout(bytes)) => outputs.stdout = Some(bytes),
            Ok(Fetched::Stderr(bytes)) => outputs.stderr = Some(bytes),
            Ok(Fetched::Inline(bytes)) => outputs.inline_contents = Some(bytes),
            Ok(Fetched::TreeContents(digest, contents)) => {
                outputs.tree_contents.insert(digest, contents);
            }
            Err(unit_failures) => failures.extend(unit_failures),
        }
    }

    if !failures.is_empty() {
        // Dropping the stages erases their temporary files; tree roots created above are
        // retained for the surrounding build to inspect.
        drop(staged_files);
        return Err(aggregate_failures(failures));
    }

    commit(executor, staged_files, symlinks).await?;
    Ok(outputs)
}

async fn fetch_file(
    store: &ByteStore,
    executor: &Executor,
    file: &FileDownload,
) -> FetchResult {
    let bytes = store
        .load_bytes(file.digest)
        .await
        .map_err(|e| vec![DownloadFailure::Store(e)])?;
    let staged = stage_file(executor, file.path.clone(), bytes, file.is_executable)
        .await
        .map_err(|e| vec![DownloadFailure::Store(Arc::new(StoreError::Unclassified(e)))])?;
    Ok(Fetched::Files {
        staged: vec![staged],
        symlinks: vec![],
    })
}

async fn fetch_tree(
    store: &ByteStore,
    executor: &Executor,
    tree: &TreeDownload,
) -> FetchResult {
    // The root directory is created up front (a tree output exists on disk even when the
    // tree is empty) and is retained if anything below fails.
    let root = tree.root.clone();
    run_blocking(executor, move || {
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create output directory {root:?}: {e}"))
    })
    .await
    .map_err(|e| vec![DownloadFailure::Store(Arc::new(StoreError::Unclassified(e)))])?;

    let manifest = load_tree_manifest(store, tree.tree_digest)
        .await
        .map_err(|failure| vec![failure])?;
    let contents = TreeContents::expand(&manifest).map_err(|message| {
        vec![DownloadFailure::MalformedTree {
            digest: tree.tree_digest,
            message,
        }]
    })?;

    // Tree-internal symlink targets are only known once the manifest arrives; hold them to
    // the same relative-target rule as top-level output symlinks.
    for link in &contents.symlinks {
        if link.target.is_absolute() {
            return Err(vec![DownloadFailure::MalformedTree {
                digest: tree.tree_digest,
                message: format!(
                    "Symlink {:?} has an absolute target {:?}.",
                    link.path, link.target
                ),
            }]);
        }
    }

    let directories: Vec<PathBuf> = contents
        .directories
        .iter()
        .map(|dir| tree.root.join(dir))
        .collect();
    run_blocking(executor, move || {
        for directory in &directories {
            std::fs::create_dir_all(directory)
                .map_err(|e| format!("Failed to create output directory {directory:?}: {e}"))?;
        }
        Ok(())
    })
    .await
    .map_err(|e| vec![DownloadFailure::Store(Arc::new(StoreError::Unclassified(e)))])?;

    let file_fetches = contents.files.iter().map(|entry| {
        let destination = tree.root.join(&entry.path);
        async move {
            let bytes = store
                .load_bytes(entry.digest)
                .await
                .map_err(DownloadFailure::Store)?;
            stage_file(executor, destination, bytes, entry.is_executable)
                .await
                .map_err(|e| DownloadFailure::Store(Arc::new(StoreError::Unclassified(e))))
        }
    });
    let results = future::join_all(file_fetches).await;

    let mut staged = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(stage) => staged.push(stage),
            Err(failure) => failures.push(failure),
        }
    }
    if !failures.is_empty() {
        // Successfully staged siblings of the failed fetch are erased on drop here.
        return Err(failures);
    }

    let symlinks = contents
        .symlinks
        .iter()
        .map(|link| (tree.root.join(&link.path), link.target.clone()))
        .collect();
    Ok(Fetched::Files { staged, symlinks })
}

async fn load_tree_manifest(
    store: &ByteStore,
    digest: Digest,
) -> Result<remexec::Tree, DownloadFailure> {
    let bytes = store
        .load_bytes(digest)
        .await
        .map_err(DownloadFailure::Store)?;
    remexec::Tree::decode(bytes).map_err(|e| DownloadFailure::MalformedTree {
        digest,
        message: format!("Failed to decode Tree manifest: {e}"),
    })
}

fn stdio_unit<'a>(
    store: &'a ByteStore,
    source: &StdioSource,
    wrap: fn(Bytes) -> Fetched,
) -> Option<BoxFuture<'a, FetchResult>> {
    match source {
        StdioSource::Absent => None,
        StdioSource::Raw(bytes) => {
            let bytes = bytes.clone();
            Some(async move { Ok(wrap(bytes)) }.boxed())
        }
        StdioSource::Fetch(digest) => {
            let digest = *digest;
            Some(
                async move {
                    let bytes = store
                        .load_bytes(digest)
                        .await
                        .map_err(|e| vec![DownloadFailure::Store(e)])?;
                    Ok(wrap(bytes))
                }
                .boxed(),
            )
        }
    }
}

async fn stage_file(
    executor: &Executor,
    destination: PathBuf,
    bytes: Bytes,
    is_executable: bool,
) -> Result<StagedFile, String> {
    run_blocking(executor, move || {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                format!("Failed to create parent directory for {destination:?}: {e}")
            })?;
        }
        StagedFile::stage(&destination, &bytes, is_executable)
    })
    .await
}

/// Rename every staged file into place and create the symlinks. Runs only once every fetch
/// has settled successfully.
async fn commit(
    executor: &Executor,
    staged_files: Vec<StagedFile>,
    symlinks: Vec<(PathBuf, PathBuf)>,
) -> Result<(), MaterializeError> {
    run_blocking(executor, move || {
        for staged in staged_files {
            staged.commit()?;
        }
        for (path, target) in symlinks {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create parent directory for {path:?}: {e}"))?;
            }
            if std::fs::symlink_metadata(&path).is_ok() {
                std::fs::remove_file(&path)
                    .map_err(|e| format!("Failed to remove stale output at {path:?}: {e}"))?;
            }
            std::os::unix::fs::symlink(&target, &path)
                .map_err(|e| format!("Failed to create symlink {path:?} -> {target:?}: {e}"))?;
        }
        Ok(())
    })
    .await
    .map_err(MaterializeError::Unclassified)
}

async fn run_blocking<F, R>(executor: &Executor, f: F) -> Result<R, String>
where
    F: FnOnce() -> Result<R, String> + Send + 'static,
    R: Send + 'static,
{
    executor
        .spawn_blocking(f, |join_error| {
            Err(format!("Filesystem task failed: {join_error}"))
        })
        .await
}

fn aggregate_failures(failures: Vec<DownloadFailure>) -> MaterializeError {
    // A single interruption shared by many fetches is surfaced once, as an interruption
    // rather than as a transfer failure.
    if failures
        .iter()
        .any(|f| matches!(f, DownloadFailure::Store(e) if e.is_interrupted()))
    {
        return MaterializeError::Interrupted;
    }

    if let Some(DownloadFailure::MalformedTree { digest, message }) = failures
        .iter()
        .find(|f| matches!(f, DownloadFailure::MalformedTree { .. }))
    {
        return MaterializeError::MalformedTree {
            digest: *digest,
            message: message.clone(),
        };
    }

    let mut bulk: Option<BulkTransferError> = None;
    for failure in failures {
        if let DownloadFailure::Store(err) = failure {
            match &mut bulk {
                None => bulk = Some(BulkTransferError::new(err)),
                Some(b) => b.attach(err),
            }
        }
    }
    match bulk {
        Some(bulk) => MaterializeError::BulkTransfer(bulk),
        None => MaterializeError::Unclassified(
            "Download failed, but no underlying cause was recorded.".to_owned(),
        ),
    }
}
