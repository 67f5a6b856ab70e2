//! Property-based tests for determinism guarantees

use proptest::prelude::*;
use skein::context::{encode_segments, ContextBudget, ContextBuilder, LoadedFile, SegmentLimits};
use skein::tree::hasher;
use skein::types::{FileDescriptor, FileId};
use skein::workspace::{ContextPreferencesState, Selection, WorkspaceSnapshot};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn names_with_permutation() -> impl Strategy<Value = (BTreeSet<String>, Vec<usize>)> {
    prop::collection::btree_set("[a-z]{1,8}", 1..12).prop_flat_map(|names| {
        let order: Vec<usize> = (0..names.len()).collect();
        (Just(names), Just(order).prop_shuffle())
    })
}

fn descriptors_for(names: &BTreeSet<String>) -> Vec<FileDescriptor> {
    let mut root = FileDescriptor::directory(FileId::new(), PathBuf::from("/w"));
    let mut descriptors = Vec::new();
    for (size, name) in names.iter().enumerate() {
        let file = FileDescriptor::file(
            FileId::new(),
            Path::new("/w").join(format!("{}.rs", name)),
            size as u64,
            Some(hasher::compute_content_hash(name.as_bytes())),
        );
        root.children.push(file.id);
        descriptors.push(file);
    }
    descriptors.push(root);
    descriptors
}

/// Snapshot order and hash do not depend on how descriptors arrive
#[test]
fn test_snapshot_hash_permutation_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&names_with_permutation(), |(names, order)| {
            let descriptors = descriptors_for(&names);
            let files = &descriptors[..descriptors.len() - 1];
            let mut shuffled: Vec<FileDescriptor> =
                order.iter().map(|&i| files[i].clone()).collect();
            let mut root = descriptors[descriptors.len() - 1].clone();
            root.children = order.iter().map(|&i| files[i].id).collect();
            shuffled.insert(0, root);

            let preferences = ContextPreferencesState::default()
                .with_inclusion(&files[0].canonical_path, false);
            let build = |descriptors: Vec<FileDescriptor>| {
                WorkspaceSnapshot::build(
                    Some(PathBuf::from("/w")),
                    Selection::cleared(),
                    preferences.clone(),
                    descriptors,
                )
            };
            let a = build(descriptors.clone());
            let b = build(shuffled);

            prop_assert_eq!(&a.snapshot_hash, &b.snapshot_hash);
            let paths = |s: &WorkspaceSnapshot| -> Vec<PathBuf> {
                s.descriptors.iter().map(|d| d.canonical_path.clone()).collect()
            };
            prop_assert_eq!(paths(&a), paths(&b));
            Ok(())
        })
        .unwrap();
}

/// Every attached file lands in exactly one segment, in path order, and a
/// segment only exceeds its limits when it holds a single file
#[test]
fn test_segmentation_partition_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec(1usize..5_000, 0..20),
                1_000usize..10_000,
                250usize..2_500,
            ),
            |(sizes, max_bytes, max_tokens)| {
                let files: Vec<LoadedFile> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, size)| {
                        LoadedFile::new(PathBuf::from(format!("/w/f{:03}.txt", i)), "q".repeat(*size))
                    })
                    .collect();
                let limits = SegmentLimits {
                    max_bytes,
                    max_tokens,
                };
                let segments = encode_segments(&files, &limits);

                let flattened: Vec<PathBuf> =
                    segments.iter().flat_map(|s| s.files.clone()).collect();
                let expected: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
                prop_assert_eq!(flattened, expected);

                for segment in &segments {
                    let over = segment.total_bytes > max_bytes || segment.total_tokens > max_tokens;
                    prop_assert!(!over || segment.files.len() == 1);
                }
                Ok(())
            },
        )
        .unwrap();
}

/// Applied budgets never exceed their totals and account for every file
#[test]
fn test_budget_totals_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::vec(0usize..4_000, 0..16),
                500usize..3_000,
                1_000usize..20_000,
            ),
            |(sizes, per_file, total)| {
                let files: Vec<LoadedFile> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, size)| {
                        LoadedFile::new(PathBuf::from(format!("/w/{:02}.md", i)), "m".repeat(*size))
                    })
                    .collect();
                let budget = ContextBudget {
                    max_per_file_bytes: per_file,
                    max_total_bytes: total,
                    ..ContextBudget::default()
                };
                let result = ContextBuilder::build(files.clone(), &budget);

                prop_assert!(result.total_bytes <= total);
                prop_assert_eq!(
                    result.attachments.len() + result.excluded_files.len(),
                    files.len()
                );
                prop_assert!(result.attachments.iter().all(|f| f.byte_count <= per_file));
                prop_assert_eq!(
                    result.total_bytes,
                    result.attachments.iter().map(|f| f.byte_count).sum::<usize>()
                );
                Ok(())
            },
        )
        .unwrap();
}
