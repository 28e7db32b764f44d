// File transfer service
// SFTP uploads proven by downloading each file back and comparing digests

use crate::errors::DeployError;
use crate::hasher::{self, Manifest};
use crate::models::RemoteTarget;
use crate::telemetry;
use crate::transport::{remote_join, remote_parent, FileStore, SessionLease, SessionRegistry};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument, warn};

/// TransferReport describes a verified upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Remote path of the uploaded file or directory root
    pub remote_path: String,
    pub files: usize,
    pub bytes: u64,
}

/// FileTransfer uploads local content and verifies it arrived intact
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Upload one file into `remote_dir`, keeping its file name
    async fn upload_file(
        &self,
        local: &Path,
        target: &RemoteTarget,
        remote_dir: &str,
    ) -> Result<TransferReport, DeployError>;

    /// Upload the contents of `local` into `remote_root`, recursively
    async fn upload_directory(
        &self,
        local: &Path,
        target: &RemoteTarget,
        remote_root: &str,
    ) -> Result<TransferReport, DeployError>;
}

/// TransferService opens one transient SFTP session per transfer
pub struct TransferService {
    registry: Arc<SessionRegistry>,
    scratch_dir: PathBuf,
}

impl TransferService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory receiving read-back copies during verification
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    async fn open_store(
        &self,
        target: &RemoteTarget,
    ) -> Result<(SessionLease, Box<dyn FileStore>), DeployError> {
        let lease = self.registry.lease(target).await?;
        match lease.session().connection().open_file_store().await {
            Ok(store) => Ok((lease, store)),
            Err(e) => {
                let outcome = Err(e);
                self.registry.release_after(lease, &outcome).await;
                outcome
            }
        }
    }

    /// Download `remote` to a scratch file and compare its digest
    ///
    /// The scratch file is removed when this returns.
    async fn verify_remote(
        &self,
        store: &dyn FileStore,
        remote: &str,
        local: &Path,
        expected: &str,
    ) -> Result<(), DeployError> {
        let scratch = NamedTempFile::new_in(&self.scratch_dir)?;
        store.get(remote, scratch.path()).await?;
        let actual = hasher::hash_file(scratch.path()).await?;
        drop(scratch);

        if actual != expected {
            error!(
                remote_path = %remote,
                local_digest = %expected,
                remote_digest = %actual,
                "Integrity check failed"
            );
            return Err(DeployError::Integrity {
                path: local.to_path_buf(),
                local: expected.to_string(),
                remote: actual,
            });
        }
        debug!(remote_path = %remote, "Digest verified");
        Ok(())
    }

    async fn put_file(
        &self,
        store: &dyn FileStore,
        local: &Path,
        remote_dir: &str,
        remote: &str,
        expected: &str,
    ) -> Result<u64, DeployError> {
        if let Err(e) = store.create_dir_all(remote_dir).await {
            warn!(remote_dir = %remote_dir, error = %e, "Could not ensure remote directory");
        }
        let bytes = store.put(local, remote).await?;
        self.verify_remote(store, remote, local, expected).await?;
        Ok(bytes)
    }

    async fn put_tree(
        &self,
        store: &dyn FileStore,
        local: &Path,
        remote_root: &str,
        manifest: &Manifest,
    ) -> Result<u64, DeployError> {
        store.create_dir_all(remote_root).await?;

        let remote_dirs: BTreeSet<String> = manifest
            .keys()
            .map(|relative| remote_join(remote_root, relative))
            .filter_map(|remote| remote_parent(&remote).map(str::to_string))
            .filter(|dir| dir.as_str() != remote_root.trim_end_matches('/'))
            .collect();
        for dir in &remote_dirs {
            store.create_dir_all(dir).await?;
        }

        let mut bytes = 0;
        for relative in manifest.keys() {
            let source = local.join(relative);
            bytes += store.put(&source, &remote_join(remote_root, relative)).await?;
        }
        debug!(files = manifest.len(), bytes, "Directory tree uploaded");

        // Scratch copies are removed one by one as verification proceeds
        for (relative, expected) in manifest {
            let source = local.join(relative);
            let remote = remote_join(remote_root, relative);
            self.verify_remote(store, &remote, &source, expected).await?;
        }
        Ok(bytes)
    }
}

#[async_trait]
impl FileTransfer for TransferService {
    #[instrument(skip(self, target), fields(target = %target, local = %local.display()))]
    async fn upload_file(
        &self,
        local: &Path,
        target: &RemoteTarget,
        remote_dir: &str,
    ) -> Result<TransferReport, DeployError> {
        let file_name = local
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DeployError::NotFound(local.display().to_string()))?;
        let remote = remote_join(remote_dir, file_name);
        let expected = hasher::hash_file(local).await?;

        info!(remote_path = %remote, "Uploading file");
        let (lease, store) = self.open_store(target).await?;
        let outcome = self
            .put_file(store.as_ref(), local, remote_dir, &remote, &expected)
            .await;
        store.close().await;
        self.registry.release_after(lease, &outcome).await;

        let bytes = outcome?;
        telemetry::record_transfer_bytes(&target.host, bytes);
        info!(outcome = "success", remote_path = %remote, bytes, "File uploaded and verified");
        Ok(TransferReport {
            remote_path: remote,
            files: 1,
            bytes,
        })
    }

    #[instrument(skip(self, target), fields(target = %target, local = %local.display()))]
    async fn upload_directory(
        &self,
        local: &Path,
        target: &RemoteTarget,
        remote_root: &str,
    ) -> Result<TransferReport, DeployError> {
        let manifest = hasher::hash_tree(local).await?;

        info!(remote_root = %remote_root, files = manifest.len(), "Uploading directory");
        let (lease, store) = self.open_store(target).await?;
        let outcome = self
            .put_tree(store.as_ref(), local, remote_root, &manifest)
            .await;
        store.close().await;
        self.registry.release_after(lease, &outcome).await;

        let bytes = outcome?;
        telemetry::record_transfer_bytes(&target.host, bytes);
        info!(
            outcome = "success",
            remote_root = %remote_root,
            files = manifest.len(),
            bytes,
            "Directory uploaded and verified"
        );
        Ok(TransferReport {
            remote_path: remote_root.to_string(),
            files: manifest.len(),
            bytes,
        })
    }
}
