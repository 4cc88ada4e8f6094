// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;

use maplit::btreemap;
use testutil::data::{TestData, TestDirectory, TestTree};

use crate::plan::{plan_outputs, StdioSource};
use crate::{
    MaterializeError, OutputPathResolver, OutputPathsLayout, RemoteExecutionServiceOptions,
    RemoteOutputsMode, Spawn, REMOTE_EXECUTION_INLINE_OUTPUTS,
};
use protos::remexec;

fn spawn() -> Spawn {
    spawn_with_info(BTreeMap::new())
}

fn spawn_with_info(execution_info: BTreeMap<String, String>) -> Spawn {
    Spawn {
        description: "compile prospecting_report".to_owned(),
        output_files: BTreeSet::new(),
        output_directories: BTreeSet::new(),
        execution_info,
    }
}

fn options(mode: RemoteOutputsMode) -> RemoteExecutionServiceOptions {
    RemoteExecutionServiceOptions {
        outputs_mode: mode,
        ..RemoteExecutionServiceOptions::default()
    }
}

fn resolver() -> OutputPathResolver {
    OutputPathResolver::new(
        PathBuf::from("/workspace/execroot"),
        OutputPathsLayout::ExecRootRelative,
    )
}

fn output_file(path: &str, data: &TestData, is_executable: bool) -> remexec::OutputFile {
    remexec::OutputFile {
        path: path.to_owned(),
        digest: Some((&data.digest()).into()),
        is_executable,
        ..remexec::OutputFile::default()
    }
}

fn output_directory(path: &str, tree: &TestTree) -> remexec::OutputDirectory {
    remexec::OutputDirectory {
        path: path.to_owned(),
        tree_digest: Some((&tree.digest()).into()),
        is_topologically_sorted: false,
    }
}

fn output_symlink(path: &str, target: &str) -> remexec::OutputSymlink {
    remexec::OutputSymlink {
        path: path.to_owned(),
        target: target.to_owned(),
    }
}

#[test]
fn mode_parses_from_snake_case() {
    assert_eq!(
        RemoteOutputsMode::from_str("all").unwrap(),
        RemoteOutputsMode::All
    );
    assert_eq!(
        RemoteOutputsMode::from_str("top_level").unwrap(),
        RemoteOutputsMode::TopLevel
    );
    assert_eq!(
        RemoteOutputsMode::from_str("minimal").unwrap(),
        RemoteOutputsMode::Minimal
    );
    assert!(RemoteOutputsMode::from_str("everything").is_err());
}

#[test]
fn resolver_maps_wire_paths_under_exec_root() {
    let resolver = resolver();
    assert_eq!(
        resolver.resolve("outputs/report").unwrap(),
        PathBuf::from("/workspace/execroot/outputs/report")
    );
}

#[test]
fn resolver_sibling_layout_strips_workspace_segment() {
    let resolver = OutputPathResolver::new(
        PathBuf::from("/workspace/execroot"),
        OutputPathsLayout::SiblingRepository,
    );
    assert_eq!(
        resolver.resolve("execroot/outputs/report").unwrap(),
        PathBuf::from("/workspace/execroot/outputs/report")
    );
    // A path which does not start with the workspace segment resolves as-is.
    assert_eq!(
        resolver.resolve("outputs/report").unwrap(),
        PathBuf::from("/workspace/execroot/outputs/report")
    );
}

#[test]
fn resolver_rejects_escaping_paths() {
    let resolver = resolver();
    for candidate in ["../sibling", "/etc/passwd", "outputs/../../sibling"] {
        let err = resolver.resolve(candidate).unwrap_err();
        assert!(
            matches!(err, MaterializeError::InvalidOutputPath { .. }),
            "Want InvalidOutputPath for {candidate:?}, got {err:?}"
        );
    }
}

#[test]
fn all_mode_downloads_files_and_trees() {
    let report = TestData::new("ore levels nominal");
    let tree = TestTree::from(TestDirectory::empty());
    let result = remexec::ActionResult {
        output_files: vec![output_file("outputs/report", &report, false)],
        output_directories: vec![output_directory("outputs/samples", &tree)],
        ..remexec::ActionResult::default()
    };

    let plan = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap();

    assert_eq!(plan.file_downloads.len(), 1);
    assert_eq!(
        plan.file_downloads[0].path,
        PathBuf::from("/workspace/execroot/outputs/report")
    );
    assert_eq!(plan.file_downloads[0].digest, report.digest());
    assert_eq!(plan.tree_downloads.len(), 1);
    assert_eq!(
        plan.tree_downloads[0].root,
        PathBuf::from("/workspace/execroot/outputs/samples")
    );
    assert!(plan.inject_files.is_empty());
    assert!(plan.inject_trees.is_empty());
    assert_eq!(plan.inline_output, None);
}

#[test]
fn minimal_mode_injects_everything() {
    let report = TestData::new("ore levels nominal");
    let tree = TestTree::from(TestDirectory::empty());
    let result = remexec::ActionResult {
        output_files: vec![output_file("outputs/report", &report, false)],
        output_directories: vec![output_directory("outputs/samples", &tree)],
        ..remexec::ActionResult::default()
    };

    let plan = plan_outputs(
        &spawn(),
        &result,
        &options(RemoteOutputsMode::Minimal),
        &resolver(),
    )
    .unwrap();

    assert!(plan.file_downloads.is_empty());
    assert!(plan.tree_downloads.is_empty());
    assert_eq!(plan.inject_files.len(), 1);
    assert_eq!(plan.inject_files[0].wire_path, PathBuf::from("outputs/report"));
    assert_eq!(plan.inject_trees.len(), 1);
    assert_eq!(plan.inject_trees[0].tree_digest, tree.digest());
}

#[test]
fn toplevel_mode_downloads_only_configured_outputs() {
    let report = TestData::new("ore levels nominal");
    let log = TestData::new("drill log");
    let result = remexec::ActionResult {
        output_files: vec![
            output_file("outputs/report", &report, false),
            output_file("outputs/drill.log", &log, false),
        ],
        ..remexec::ActionResult::default()
    };
    let mut options = options(RemoteOutputsMode::TopLevel);
    options.top_level_outputs = [PathBuf::from("outputs/report")].into_iter().collect();

    let plan = plan_outputs(&spawn(), &result, &options, &resolver()).unwrap();

    assert_eq!(plan.file_downloads.len(), 1);
    assert_eq!(plan.file_downloads[0].digest, report.digest());
    assert_eq!(plan.inject_files.len(), 1);
    assert_eq!(plan.inject_files[0].digest, log.digest());
}

#[test]
fn inline_override_behaves_as_minimal_plus_one_in_memory_output() {
    let wanted = TestData::new("inline me");
    let other = TestData::new("leave me remote");
    let result = remexec::ActionResult {
        output_files: vec![
            output_file("outputs/wanted", &wanted, false),
            output_file("outputs/other", &other, false),
        ],
        ..remexec::ActionResult::default()
    };
    let spawn = spawn_with_info(btreemap! {
        REMOTE_EXECUTION_INLINE_OUTPUTS.to_owned() => "outputs/wanted".to_owned(),
    });

    // The per-spawn override applies even when the configured mode downloads everything.
    let plan = plan_outputs(&spawn, &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap();

    assert!(plan.file_downloads.is_empty());
    assert_eq!(plan.inject_files.len(), 2);
    let inline = plan.inline_output.unwrap();
    assert_eq!(inline.wire_path, PathBuf::from("outputs/wanted"));
    assert_eq!(inline.digest, wanted.digest());
}

#[test]
fn inline_path_missing_from_result_plans_no_in_memory_output() {
    let other = TestData::new("leave me remote");
    let result = remexec::ActionResult {
        output_files: vec![output_file("outputs/other", &other, false)],
        ..remexec::ActionResult::default()
    };
    let spawn = spawn_with_info(btreemap! {
        REMOTE_EXECUTION_INLINE_OUTPUTS.to_owned() => "outputs/wanted".to_owned(),
    });

    let plan = plan_outputs(&spawn, &result, &options(RemoteOutputsMode::Minimal), &resolver())
        .unwrap();

    assert_eq!(plan.inline_output, None);
    // The present output is still metadata-injected.
    assert_eq!(plan.inject_files.len(), 1);
}

#[test]
fn absolute_symlink_target_fails_before_planning_any_fetch() {
    let report = TestData::new("ore levels nominal");
    let result = remexec::ActionResult {
        output_files: vec![output_file("outputs/report", &report, false)],
        output_file_symlinks: vec![output_symlink("outputs/link", "/abs/target")],
        ..remexec::ActionResult::default()
    };

    let err = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap_err();

    match &err {
        MaterializeError::AbsoluteSymlinkTarget { path, target } => {
            assert_eq!(path, "outputs/link");
            assert_eq!(target, "/abs/target");
        }
        other => panic!("Want AbsoluteSymlinkTarget, got {other:?}"),
    }
    let rendered = err.to_string();
    assert!(rendered.contains("outputs/link"), "missing path: {rendered}");
    assert!(rendered.contains("/abs/target"), "missing target: {rendered}");
}

#[test]
fn symlink_listed_in_legacy_and_unified_fields_collapses() {
    let result = remexec::ActionResult {
        output_file_symlinks: vec![output_symlink("outputs/link", "report")],
        output_symlinks: vec![output_symlink("outputs/link", "report")],
        ..remexec::ActionResult::default()
    };

    let plan = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap();

    assert_eq!(plan.symlinks.len(), 1);
    assert_eq!(plan.symlinks[0].target, PathBuf::from("report"));
}

#[test]
fn conflicting_symlink_targets_are_rejected() {
    let result = remexec::ActionResult {
        output_file_symlinks: vec![output_symlink("outputs/link", "report")],
        output_symlinks: vec![output_symlink("outputs/link", "elsewhere")],
        ..remexec::ActionResult::default()
    };

    let err = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap_err();
    assert!(
        matches!(err, MaterializeError::InvalidOutputPath { .. }),
        "Want InvalidOutputPath, got {err:?}"
    );
}

#[test]
fn colliding_output_paths_are_rejected() {
    let report = TestData::new("ore levels nominal");
    let result = remexec::ActionResult {
        output_files: vec![
            output_file("outputs/report", &report, false),
            output_file("outputs/report", &report, true),
        ],
        ..remexec::ActionResult::default()
    };

    let err = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap_err();
    assert!(
        matches!(err, MaterializeError::InvalidOutputPath { .. }),
        "Want InvalidOutputPath, got {err:?}"
    );
}

#[test]
fn stdio_raw_bytes_are_planned_without_a_fetch() {
    let result = remexec::ActionResult {
        stdout_raw: testutil::as_bytes("inline stdout"),
        ..remexec::ActionResult::default()
    };

    let plan = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap();
    assert_eq!(plan.stdout, StdioSource::Raw(testutil::as_bytes("inline stdout")));
    assert_eq!(plan.stderr, StdioSource::Absent);
}

#[test]
fn stdio_empty_digest_clears_the_stream() {
    let result = remexec::ActionResult {
        stdout_digest: Some((&TestData::empty().digest()).into()),
        stderr_digest: Some((&TestData::new("errors!").digest()).into()),
        ..remexec::ActionResult::default()
    };

    let plan = plan_outputs(&spawn(), &result, &options(RemoteOutputsMode::All), &resolver())
        .unwrap();
    assert_eq!(plan.stdout, StdioSource::Absent);
    assert_eq!(
        plan.stderr,
        StdioSource::Fetch(TestData::new("errors!").digest())
    );
}

#[test]
fn escaping_inject_only_paths_are_still_rejected() {
    let report = TestData::new("ore levels nominal");
    let result = remexec::ActionResult {
        output_files: vec![output_file("../escape", &report, false)],
        ..remexec::ActionResult::default()
    };

    let err = plan_outputs(
        &spawn(),
        &result,
        &options(RemoteOutputsMode::Minimal),
        &resolver(),
    )
    .unwrap_err();
    assert!(
        matches!(err, MaterializeError::InvalidOutputPath { .. }),
        "Want InvalidOutputPath, got {err:?}"
    );
}
