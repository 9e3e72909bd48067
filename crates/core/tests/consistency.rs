//! Serialization consistency across scanner configurations
//!
//! The round-trip law must hold no matter how the manifest was built:
//! for any tree, decoding the encoded manifest yields an equal manifest,
//! with sequential and parallel hashing producing the same value.

use std::fs;
use std::path::Path;
use timepoint_core::{codec, DigestScheme, Scanner};

fn populate_tree(root: &Path) {
    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data/region")).unwrap();

    fs::write(root.join("config/settings.toml"), b"threads = 4\n").unwrap();
    fs::write(root.join("data/index.bin"), vec![0x5A; 2048]).unwrap();
    fs::write(root.join("data/region/r.0.0.dat"), b"region zero").unwrap();
    fs::write(root.join("data/region/r.0.1.dat"), b"region one").unwrap();
    // Duplicate content across two paths
    fs::write(root.join("data/region/copy.dat"), b"region zero").unwrap();
    fs::write(root.join("empty.marker"), b"").unwrap();
}

fn check_consistency(threads: usize, parallel_threshold: usize) {
    let temp_dir = tempfile::tempdir().unwrap();
    populate_tree(temp_dir.path());

    let scanner = Scanner::new(DigestScheme::Sha256, threads, parallel_threshold);
    let manifest = scanner.scan(temp_dir.path()).unwrap();
    assert_eq!(manifest.len(), 6);

    let decoded = codec::decode(&codec::encode(&manifest)).unwrap();
    assert_eq!(manifest, decoded);
}

#[test]
fn consistency_1_thread() {
    check_consistency(1, 0);
}

#[test]
fn consistency_2_threads() {
    check_consistency(2, 0);
}

#[test]
fn consistency_4_threads() {
    check_consistency(4, 0);
}

#[test]
fn consistency_8_threads() {
    check_consistency(8, 0);
}

#[test]
fn consistency_1_thread_high_threshold() {
    check_consistency(1, 1000);
}

#[test]
fn consistency_2_threads_high_threshold() {
    check_consistency(2, 1000);
}

#[test]
fn consistency_4_threads_high_threshold() {
    check_consistency(4, 1000);
}

#[test]
fn consistency_8_threads_high_threshold() {
    check_consistency(8, 1000);
}

#[test]
fn manifests_agree_across_all_configurations() {
    let temp_dir = tempfile::tempdir().unwrap();
    populate_tree(temp_dir.path());

    let baseline = Scanner::new(DigestScheme::Blake3, 1, 1000)
        .scan(temp_dir.path())
        .unwrap();

    for threads in [1, 2, 4, 8] {
        for threshold in [0, 1000] {
            let manifest = Scanner::new(DigestScheme::Blake3, threads, threshold)
                .scan(temp_dir.path())
                .unwrap();
            assert_eq!(
                baseline, manifest,
                "threads = {}, threshold = {}",
                threads, threshold
            );
        }
    }
}
