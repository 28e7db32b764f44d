// Content hasher
// SHA-256 digests for single files and whole directory trees

use crate::errors::DeployError;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on files hashed (and held open) at the same time
pub const MAX_CONCURRENT_HASHES: usize = 32;

/// Manifest maps a `/`-separated relative path to its hex digest
pub type Manifest = BTreeMap<String, String>;

/// Stream a file through SHA-256 and return the lowercase hex digest
#[instrument(fields(path = %path.display()))]
pub async fn hash_file(path: &Path) -> Result<String, DeployError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hex::encode(hasher.finalize());
    debug!(digest = %digest, "File hashed");
    Ok(digest)
}

/// Hash every regular file below `root`, recursively
///
/// Files are hashed concurrently, at most [`MAX_CONCURRENT_HASHES`] at a
/// time; the manifest is only returned once every
/// file succeeded, otherwise the first error is propagated. Symbolic links
/// are not followed.
#[instrument(fields(root = %root.display()))]
pub async fn hash_tree(root: &Path) -> Result<Manifest, DeployError> {
    let files = list_files(root).await?;
    debug!(file_count = files.len(), "Hashing directory tree");

    let hashes: Vec<_> = files.iter().map(|(_, path)| hash_file(path)).collect();
    let digests: Vec<String> = stream::iter(hashes)
        .buffered(MAX_CONCURRENT_HASHES)
        .try_collect()
        .await?;

    Ok(files
        .into_iter()
        .map(|(relative, _)| relative)
        .zip(digests)
        .collect())
}

/// Enumerate regular files below `root` as (relative path, absolute path)
pub async fn list_files(root: &Path) -> Result<Vec<(String, PathBuf)>, DeployError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_files(&root))
        .await
        .map_err(|e| DeployError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>, DeployError> {
    if !root.is_dir() {
        return Err(DeployError::NotFound(format!(
            "directory {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => relative_key(rel),
            Err(_) => continue,
        };
        files.push((relative, entry.path().to_path_buf()));
    }
    Ok(files)
}

/// Relative path with `/` separators, matching the remote POSIX layout
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_hash_file_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        let digest = hash_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_hash_file_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = hash_file(&dir.path().join("missing.bin")).await;
        assert!(matches!(result, Err(DeployError::Io(_))));
    }

    #[tokio::test]
    async fn test_hash_tree_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib/native")).unwrap();
        fs::write(dir.path().join("app.jar"), b"jar").unwrap();
        fs::write(dir.path().join("lib/util.jar"), b"util").unwrap();
        fs::write(dir.path().join("lib/native/libx.so"), b"so").unwrap();

        let manifest = hash_tree(dir.path()).await.unwrap();
        let keys: Vec<&str> = manifest.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["app.jar", "lib/native/libx.so", "lib/util.jar"]);
        assert_eq!(
            manifest["app.jar"],
            hash_file(&dir.path().join("app.jar")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_hash_tree_handles_more_files_than_descriptor_limit() {
        // Well above the usual 1024 open-file soft limit
        let dir = tempfile::tempdir().unwrap();
        for bucket in 0..16 {
            let sub = dir.path().join(format!("lib{:02}", bucket));
            fs::create_dir(&sub).unwrap();
            for n in 0..160 {
                fs::write(sub.join(format!("f{:03}.class", n)), format!("{}-{}", bucket, n)).unwrap();
            }
        }

        let manifest = hash_tree(dir.path()).await.unwrap();
        assert_eq!(manifest.len(), 16 * 160);
        assert_eq!(
            manifest["lib15/f159.class"],
            hash_file(&dir.path().join("lib15/f159.class")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_hash_tree_missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = hash_tree(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(DeployError::NotFound(_))));
    }

    #[test]
    fn test_relative_key_uses_forward_slashes() {
        let path: PathBuf = ["a", "b", "c.txt"].iter().collect();
        assert_eq!(relative_key(&path), "a/b/c.txt");
    }
}
