// Property-based tests for the content hasher
// Digest determinism, byte sensitivity and manifest coverage

use common::hasher::{hash_file, hash_tree};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_digest_is_stable_for_unchanged_bytes(bytes in prop::collection::vec(any::<u8>(), 0..8192)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, &bytes).unwrap();

        let first = block_on(hash_file(&path)).unwrap();
        let second = block_on(hash_file(&path)).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 64);
    }

    #[test]
    fn prop_digest_changes_when_any_byte_changes(
        bytes in prop::collection::vec(any::<u8>(), 1..4096),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("original.bin");
        let modified = dir.path().join("modified.bin");
        let mut changed = bytes.clone();
        let at = index.index(changed.len());
        changed[at] ^= flip;
        fs::write(&original, &bytes).unwrap();
        fs::write(&modified, &changed).unwrap();

        let a = block_on(hash_file(&original)).unwrap();
        let b = block_on(hash_file(&modified)).unwrap();
        prop_assert_ne!(a, b);
    }

    #[test]
    fn prop_manifest_covers_every_file(
        files in prop::collection::btree_map("[a-z]{1,8}(/[a-z]{1,8}){0,2}", prop::collection::vec(any::<u8>(), 0..256), 1..12)
    ) {
        let dir = TempDir::new().unwrap();
        let mut written = BTreeMap::new();
        for (relative, bytes) in &files {
            // Files end in .bin and directories never do, so paths cannot clash
            let path = dir.path().join(format!("{}.bin", relative));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, bytes).unwrap();
            written.insert(format!("{}.bin", relative), path);
        }

        let manifest = block_on(hash_tree(dir.path())).unwrap();
        prop_assert_eq!(manifest.len(), written.len());
        for (key, path) in &written {
            let expected = block_on(hash_file(path)).unwrap();
            prop_assert_eq!(manifest.get(key), Some(&expected));
        }
    }
}
