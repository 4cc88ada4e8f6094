// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs::RelativePath;
use hashing::{Digest, EMPTY_DIGEST};
use protos::remexec;
use protos::require_digest;

use crate::{
    MaterializeError, RemoteExecutionServiceOptions, RemoteOutputsMode, Spawn,
    REMOTE_EXECUTION_INLINE_OUTPUTS,
};

/// How wire paths map onto the local filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputPathsLayout {
    /// Wire paths are relative to the execution root.
    ExecRootRelative,
    /// Wire paths carry a leading segment naming the workspace root (the sibling-repository
    /// layout); the segment is stripped when present.
    SiblingRepository,
}

///
/// Maps wire paths to local paths under the execution root. Pure: no I/O, no mutation.
///
pub struct OutputPathResolver {
    exec_root: PathBuf,
    workspace_name: Option<String>,
    layout: OutputPathsLayout,
}

impl OutputPathResolver {
    pub fn new(exec_root: PathBuf, layout: OutputPathsLayout) -> OutputPathResolver {
        let workspace_name = exec_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        OutputPathResolver {
            exec_root,
            workspace_name,
            layout,
        }
    }

    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    /// Resolve a wire path to a local path. Rejects paths which would escape the execution
    /// root.
    pub fn resolve(&self, wire_path: &str) -> Result<PathBuf, MaterializeError> {
        let relative = RelativePath::new(wire_path).map_err(|reason| {
            MaterializeError::InvalidOutputPath {
                path: wire_path.to_owned(),
                reason,
            }
        })?;

        let relative: &Path = match self.layout {
            OutputPathsLayout::ExecRootRelative => relative.as_path(),
            OutputPathsLayout::SiblingRepository => match &self.workspace_name {
                Some(workspace) => relative
                    .strip_prefix(workspace)
                    .unwrap_or_else(|_| relative.as_path()),
                None => relative.as_path(),
            },
        };

        Ok(self.exec_root.join(relative))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileDownload {
    /// Local destination path.
    pub path: PathBuf,
    pub digest: Digest,
    pub is_executable: bool,
}

/// The `ActionResult` field a symlink was listed in. The distinction is advisory (all
/// symlinks materialize identically) but is preserved for re-serialization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymlinkKind {
    File,
    Directory,
    Unspecified,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedSymlink {
    /// Local symlink path.
    pub path: PathBuf,
    /// Target, verbatim from the wire. Guaranteed relative by validation.
    pub target: PathBuf,
    pub kind: SymlinkKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeDownload {
    /// Local root of the tree output.
    pub root: PathBuf,
    pub tree_digest: Digest,
}

/// Where one of the stdout/stderr streams comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StdioSource {
    /// Nothing to write: the stream stays cleared.
    Absent,
    /// The bytes were inlined into the `ActionResult`.
    Raw(Bytes),
    /// The bytes must be fetched.
    Fetch(Digest),
}

/// A file output whose bytes stay remote: only metadata is registered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InjectFile {
    pub wire_path: PathBuf,
    pub digest: Digest,
}

/// A tree output whose contents stay remote. The manifest itself is still fetched, so the
/// injected tree value can enumerate its files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InjectTree {
    pub wire_path: PathBuf,
    pub tree_digest: Digest,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlineOutput {
    pub wire_path: PathBuf,
    pub digest: Digest,
}

///
/// The uniform schedule the download orchestrator executes: the materialization mode has
/// already been resolved into per-output decisions, and every local path has been validated
/// as living under the execution root.
///
#[derive(Clone, Debug)]
pub struct DownloadPlan {
    pub file_downloads: Vec<FileDownload>,
    pub symlinks: Vec<PlannedSymlink>,
    pub tree_downloads: Vec<TreeDownload>,
    pub stdout: StdioSource,
    pub stderr: StdioSource,
    pub inject_files: Vec<InjectFile>,
    pub inject_trees: Vec<InjectTree>,
    pub inline_output: Option<InlineOutput>,
}

impl Default for DownloadPlan {
    fn default() -> Self {
        Self {
            file_downloads: Vec::new(),
            symlinks: Vec::new(),
            tree_downloads: Vec::new(),
            stdout: StdioSource::Absent,
            stderr: StdioSource::Absent,
            inject_files: Vec::new(),
            inject_trees: Vec::new(),
            inline_output: None,
        }
    }
}

///
/// Walk the `ActionResult` and resolve the materialization mode into a `DownloadPlan`.
///
/// All validation happens here, before any I/O: symlinks with absolute targets, paths which
/// escape the execution root, and colliding local paths all fail the action without a
/// single fetch being issued.
///
pub(crate) fn plan_outputs(
    spawn: &Spawn,
    result: &remexec::ActionResult,
    options: &RemoteExecutionServiceOptions,
    resolver: &OutputPathResolver,
) -> Result<DownloadPlan, MaterializeError> {
    let inline_path = spawn
        .execution_info
        .get(REMOTE_EXECUTION_INLINE_OUTPUTS)
        .map(PathBuf::from);

    // The inline override is per-spawn: when present, file and tree outputs behave as in
    // Minimal mode, plus the designated output is fetched into memory.
    let mode = if inline_path.is_some() {
        RemoteOutputsMode::Minimal
    } else {
        options.outputs_mode
    };

    let mut plan = DownloadPlan::default();
    // Local paths which will be written on disk. Keeping them unique is what makes the
    // orchestrator's parallel filesystem writes disjoint.
    let mut claimed_paths: HashSet<PathBuf> = HashSet::new();

    // Symlinks materialize in every mode. Validate their targets before anything else, so
    // that no fetch is issued for a result which cannot be materialized.
    let mut symlinks_by_path: HashMap<PathBuf, (PathBuf, SymlinkKind)> = HashMap::new();
    let symlink_lists = [
        (SymlinkKind::File, &result.output_file_symlinks),
        (SymlinkKind::Directory, &result.output_directory_symlinks),
        (SymlinkKind::Unspecified, &result.output_symlinks),
    ];
    for (kind, symlinks) in symlink_lists {
        for symlink in symlinks {
            if symlink.target.starts_with('/') {
                return Err(MaterializeError::AbsoluteSymlinkTarget {
                    path: symlink.path.clone(),
                    target: symlink.target.clone(),
                });
            }
            let local = resolver.resolve(&symlink.path)?;
            let target = PathBuf::from(&symlink.target);
            match symlinks_by_path.entry(local) {
                Entry::Vacant(entry) => {
                    entry.insert((target, kind));
                }
                Entry::Occupied(entry) => {
                    // Servers may list one symlink in both a legacy field and
                    // `output_symlinks`; identical duplicates collapse.
                    if entry.get().0 != target {
                        return Err(MaterializeError::InvalidOutputPath {
                            path: symlink.path.clone(),
                            reason: format!(
                                "Conflicting symlink targets {:?} and {target:?}.",
                                entry.get().0
                            ),
                        });
                    }
                }
            }
        }
    }
    for (path, (target, kind)) in symlinks_by_path {
        if !claimed_paths.insert(path.clone()) {
            return Err(MaterializeError::InvalidOutputPath {
                path: path.to_string_lossy().into_owned(),
                reason: "Multiple outputs resolve to this path.".to_owned(),
            });
        }
        plan.symlinks.push(PlannedSymlink { path, target, kind });
    }

    for file in &result.output_files {
        let digest =
            require_digest(file.digest.as_ref()).map_err(MaterializeError::Unclassified)?;
        let wire_path = PathBuf::from(&file.path);

        if inline_path.as_deref() == Some(wire_path.as_path()) {
            plan.inline_output = Some(InlineOutput {
                wire_path: wire_path.clone(),
                digest,
            });
        }

        if should_download(mode, options, &wire_path) {
            let local = claim(&mut claimed_paths, resolver.resolve(&file.path)?, &file.path)?;
            plan.file_downloads.push(FileDownload {
                path: local,
                digest,
                is_executable: file.is_executable,
            });
        } else {
            // Resolve anyway: an escaping path is invalid whether or not bytes land on
            // disk.
            resolver.resolve(&file.path)?;
            plan.inject_files.push(InjectFile {
                wire_path,
                digest,
            });
        }
    }

    for directory in &result.output_directories {
        let tree_digest = require_digest(directory.tree_digest.as_ref())
            .map_err(MaterializeError::Unclassified)?;
        let wire_path = PathBuf::from(&directory.path);

        if should_download(mode, options, &wire_path) {
            let local = claim(
                &mut claimed_paths,
                resolver.resolve(&directory.path)?,
                &directory.path,
            )?;
            plan.tree_downloads.push(TreeDownload {
                root: local,
                tree_digest,
            });
        } else {
            resolver.resolve(&directory.path)?;
            plan.inject_trees.push(InjectTree {
                wire_path,
                tree_digest,
            });
        }
    }

    // stdout/stderr download in every mode.
    plan.stdout = stdio_source(&result.stdout_raw, result.stdout_digest.as_ref())?;
    plan.stderr = stdio_source(&result.stderr_raw, result.stderr_digest.as_ref())?;

    Ok(plan)
}

fn claim(
    claimed_paths: &mut HashSet<PathBuf>,
    path: PathBuf,
    wire_path: &str,
) -> Result<PathBuf, MaterializeError> {
    if !claimed_paths.insert(path.clone()) {
        return Err(MaterializeError::InvalidOutputPath {
            path: wire_path.to_owned(),
            reason: format!("Multiple outputs resolve to {path:?}."),
        });
    }
    Ok(path)
}

fn should_download(
    mode: RemoteOutputsMode,
    options: &RemoteExecutionServiceOptions,
    wire_path: &Path,
) -> bool {
    match mode {
        RemoteOutputsMode::All => true,
        RemoteOutputsMode::TopLevel => options.top_level_outputs.contains(wire_path),
        RemoteOutputsMode::Minimal => false,
    }
}

fn stdio_source(
    raw: &Bytes,
    digest: Option<&remexec::Digest>,
) -> Result<StdioSource, MaterializeError> {
    if !raw.is_empty() {
        return Ok(StdioSource::Raw(raw.clone()));
    }
    match digest {
        None => Ok(StdioSource::Absent),
        Some(digest) => {
            let digest: Digest =
                digest.try_into().map_err(MaterializeError::Unclassified)?;
            if digest == EMPTY_DIGEST {
                Ok(StdioSource::Absent)
            } else {
                Ok(StdioSource::Fetch(digest))
            }
        }
    }
}
