// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::download::DownloadedOutputs;
use crate::plan::DownloadPlan;
use crate::{
    InMemoryOutput, MaterializeError, MetadataInjector, RemoteAction, RemoteFileMetadata,
    RemoteTreeMetadata, REMOTE_FILE_LOCATOR_VERSION,
};

///
/// The post-pass over a successful download: register metadata for every output whose bytes
/// deliberately stayed remote, and surface the inline output's bytes, if any.
///
/// Runs strictly after all downloads have settled and the output-tree lock is held, so the
/// injector sees a consistent view and is called serially for this action. The orchestrator
/// has already fetched and expanded the manifests of inject-only trees, so no I/O happens
/// here.
///
pub(crate) fn inject_metadata(
    action: &RemoteAction,
    plan: &DownloadPlan,
    downloaded: &DownloadedOutputs,
    injector: &dyn MetadataInjector,
) -> Result<Option<InMemoryOutput>, MaterializeError> {
    for file in &plan.inject_files {
        injector.inject_file(
            &file.wire_path,
            RemoteFileMetadata {
                digest: file.digest,
                locator_version: REMOTE_FILE_LOCATOR_VERSION,
                action_id: action.action_id().to_owned(),
            },
        );
    }

    for tree in &plan.inject_trees {
        let contents = downloaded
            .tree_contents
            .get(&tree.tree_digest)
            .ok_or_else(|| {
                MaterializeError::Unclassified(format!(
                    "Tree manifest {:?} was not downloaded.",
                    tree.tree_digest
                ))
            })?;
        let children = contents
            .files
            .iter()
            .map(|entry| {
                (
                    entry.path.clone(),
                    RemoteFileMetadata {
                        digest: entry.digest,
                        locator_version: REMOTE_FILE_LOCATOR_VERSION,
                        action_id: action.action_id().to_owned(),
                    },
                )
            })
            .collect();
        injector.inject_tree(&tree.wire_path, RemoteTreeMetadata { children });
    }

    match (&plan.inline_output, &downloaded.inline_contents) {
        (Some(inline), Some(contents)) => Ok(Some(InMemoryOutput {
            path: inline.wire_path.clone(),
            contents: contents.clone(),
        })),
        _ => Ok(None),
    }
}
