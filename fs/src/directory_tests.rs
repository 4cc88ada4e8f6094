// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;

use testutil::data::{TestData, TestDirectory, TestTree};

use crate::{FileEntry, SymlinkEntry, TreeContents};

#[test]
fn expand_empty_root() {
    let tree = TestTree::from(TestDirectory::empty());
    let contents = TreeContents::expand(&tree.tree).unwrap();
    assert!(contents.directories.is_empty());
    assert!(contents.files.is_empty());
    assert!(contents.symlinks.is_empty());
}

#[test]
fn expand_files_and_symlinks_at_root() {
    let quartz = TestData::new("quartz");
    let root = TestDirectory::empty()
        .file("crystal", &quartz, true)
        .symlink("shortcut", "crystal");
    let tree = TestTree::from(root);

    let contents = TreeContents::expand(&tree.tree).unwrap();
    assert_eq!(
        contents.files,
        vec![FileEntry {
            path: PathBuf::from("crystal"),
            digest: quartz.digest(),
            is_executable: true,
        }]
    );
    assert_eq!(
        contents.symlinks,
        vec![SymlinkEntry {
            path: PathBuf::from("shortcut"),
            target: PathBuf::from("crystal"),
        }]
    );
}

#[test]
fn expand_nested_directories() {
    let quartz = TestData::new("quartz");
    let inner = TestDirectory::empty().file("deep", &quartz, false);
    let middle = TestDirectory::empty().dir("inner", &inner);
    let root = TestDirectory::empty().dir("middle", &middle);
    let tree = TestTree::new(
        root.directory(),
        vec![middle.directory(), inner.directory()],
    );

    let contents = TreeContents::expand(&tree.tree).unwrap();
    assert_eq!(
        contents.directories,
        vec![PathBuf::from("middle"), PathBuf::from("middle/inner")]
    );
    assert_eq!(
        contents.files,
        vec![FileEntry {
            path: PathBuf::from("middle/inner/deep"),
            digest: quartz.digest(),
            is_executable: false,
        }]
    );
}

#[test]
fn expand_empty_directory_still_emitted() {
    let empty = TestDirectory::empty();
    let root = TestDirectory::empty().dir("hollow", &empty);
    let tree = TestTree::new(root.directory(), vec![empty.directory()]);

    let contents = TreeContents::expand(&tree.tree).unwrap();
    assert_eq!(contents.directories, vec![PathBuf::from("hollow")]);
    assert!(contents.files.is_empty());
}

#[test]
fn expand_shared_child_digest() {
    // Both `geode` references share one child digest, and the manifest lists the shared
    // child twice: each reference still expands to its own path.
    let quartz = TestData::new("quartz");
    let geode = TestDirectory::empty().file("crystal", &quartz, false);
    let nested = TestDirectory::empty().dir("geode", &geode);
    let root = TestDirectory::empty().dir("geode", &geode).dir("shelf", &nested);
    let tree = TestTree::new(
        root.directory(),
        vec![geode.directory(), nested.directory(), geode.directory()],
    );

    let contents = TreeContents::expand(&tree.tree).unwrap();
    let mut file_paths: Vec<_> = contents.files.iter().map(|f| f.path.clone()).collect();
    file_paths.sort();
    assert_eq!(
        file_paths,
        vec![
            PathBuf::from("geode/crystal"),
            PathBuf::from("shelf/geode/crystal"),
        ]
    );
    assert!(contents.files.iter().all(|f| f.digest == quartz.digest()));
}

#[test]
fn expand_empty_directory_shared_multiple_times() {
    let empty = TestDirectory::empty();
    let root = TestDirectory::empty()
        .dir("one", &empty)
        .dir("two", &empty);
    let tree = TestTree::new(
        root.directory(),
        vec![empty.directory(), empty.directory()],
    );

    let contents = TreeContents::expand(&tree.tree).unwrap();
    assert_eq!(
        contents.directories,
        vec![PathBuf::from("one"), PathBuf::from("two")]
    );
}

#[test]
fn expand_missing_child_is_malformed() {
    let quartz = TestData::new("quartz");
    let geode = TestDirectory::empty().file("crystal", &quartz, false);
    let root = TestDirectory::empty().dir("geode", &geode);
    // The child Directory is referenced but not listed in the manifest.
    let tree = TestTree::new(root.directory(), vec![]);

    let err = TreeContents::expand(&tree.tree).unwrap_err();
    assert!(
        err.contains("was not present in the Tree"),
        "Want malformed-tree error, got {err:?}"
    );
}

#[test]
fn expand_missing_root_is_malformed() {
    let tree = protos::remexec::Tree {
        root: None,
        children: vec![],
    };
    let err = TreeContents::expand(&tree).unwrap_err();
    assert!(err.contains("no root"), "Want no-root error, got {err:?}");
}

#[test]
fn expand_rejects_separator_in_name() {
    let quartz = TestData::new("quartz");
    let mut root = TestDirectory::empty()
        .file("fine", &quartz, false)
        .directory;
    root.files[0].name = "not/fine".to_owned();
    let tree = TestTree::new(root, vec![]);

    let err = TreeContents::expand(&tree.tree).unwrap_err();
    assert!(
        err.contains("Illegal node name"),
        "Want illegal-name error, got {err:?}"
    );
}
