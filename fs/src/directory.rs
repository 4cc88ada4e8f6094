// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use hashing::Digest;
use protos::remexec;
use protos::{require_digest, MessageExt};

/// A file emitted while expanding a `Tree` manifest, with its path relative to the tree root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A symlink emitted while expanding a `Tree` manifest, with its path relative to the tree
/// root. The target is carried verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymlinkEntry {
    pub path: PathBuf,
    pub target: PathBuf,
}

/// The flattened contents of a `Tree` manifest: every directory (including empty ones),
/// file, and symlink reachable from the root, with paths relative to the tree root.
///
/// `directories` is emitted in breadth-first order, so creating them in sequence never
/// requires a missing parent. The tree root itself is not listed; it is the caller's to
/// create, and must exist even when the tree is empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeContents {
    pub directories: Vec<PathBuf>,
    pub files: Vec<FileEntry>,
    pub symlinks: Vec<SymlinkEntry>,
}

impl TreeContents {
    ///
    /// Expand a `Tree` manifest.
    ///
    /// Children are looked up by the digest of their canonical encoding. The same child
    /// digest may be referenced by several `DirectoryNode`s and may be listed more than once
    /// in `children`: listings with equal digests are byte-identical by content addressing,
    /// so duplicates collapse to one entry in the lookup while each *reference* still
    /// expands independently to its own path. References are by content hash, so cycles
    /// cannot occur. A referenced child digest with no corresponding `Directory` in the
    /// manifest fails the expansion.
    ///
    pub fn expand(tree: &remexec::Tree) -> Result<TreeContents, String> {
        let root = tree
            .root
            .as_ref()
            .ok_or_else(|| "Tree had no root Directory.".to_owned())?;

        let mut children_by_digest: HashMap<Digest, &remexec::Directory> =
            HashMap::with_capacity(tree.children.len());
        for child in &tree.children {
            let digest = Digest::of_bytes(&child.to_bytes());
            children_by_digest.entry(digest).or_insert(child);
        }

        let mut contents = TreeContents::default();
        let mut to_visit: VecDeque<(PathBuf, &remexec::Directory)> = VecDeque::new();
        to_visit.push_back((PathBuf::new(), root));

        while let Some((prefix, directory)) = to_visit.pop_front() {
            for file_node in &directory.files {
                let name = validated_name(&file_node.name, &prefix)?;
                let digest = require_digest(file_node.digest.as_ref())?;
                contents.files.push(FileEntry {
                    path: prefix.join(name),
                    digest,
                    is_executable: file_node.is_executable,
                });
            }
            for symlink_node in &directory.symlinks {
                let name = validated_name(&symlink_node.name, &prefix)?;
                contents.symlinks.push(SymlinkEntry {
                    path: prefix.join(name),
                    target: PathBuf::from(&symlink_node.target),
                });
            }
            for dir_node in &directory.directories {
                let name = validated_name(&dir_node.name, &prefix)?;
                let digest = require_digest(dir_node.digest.as_ref())?;
                let child = children_by_digest.get(&digest).copied().ok_or_else(|| {
                    format!("Child directory {name} with {digest:?} was not present in the Tree.")
                })?;
                let path = prefix.join(name);
                contents.directories.push(path.clone());
                to_visit.push_back((path, child));
            }
        }

        Ok(contents)
    }
}

/// Node names must be single, non-empty path components: anything else would let a manifest
/// write outside its own root.
fn validated_name<'a>(name: &'a str, prefix: &std::path::Path) -> Result<&'a str, String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(format!(
            "Illegal node name {name:?} under {prefix:?} in Tree."
        ));
    }
    Ok(name)
}
