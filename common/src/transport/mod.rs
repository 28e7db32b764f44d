// Transport layer: authenticated connections to remote hosts
// Connector opens connections, SessionRegistry owns and reuses them

mod prompt;
mod session;
mod ssh;

pub use prompt::{CredentialProvider, StaticCredential, TerminalPrompt};
pub use session::{Session, SessionLease, SessionRegistry};
pub use ssh::{Ssh2Connection, Ssh2Connector};

use crate::errors::DeployError;
use crate::models::{CommandResult, Credential, RemoteTarget};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Connector opens one authenticated connection to a target
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate, blocking until the remote end is ready or fails
    async fn connect(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, DeployError>;
}

/// Connection is a live, authenticated SSH connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `command` in a pseudo-terminal backed channel
    ///
    /// `stdin`, when present, is written to the remote process followed by a
    /// newline and end-of-file; such commands run without a PTY. The result carries the exit code; a non-zero code is not an
    /// error at this level.
    async fn exec(&self, command: &str, stdin: Option<&str>)
        -> Result<CommandResult, DeployError>;

    /// Open a transient file-transfer (SFTP) session
    async fn open_file_store(&self) -> Result<Box<dyn FileStore>, DeployError>;

    /// Tear the connection down; errors are swallowed
    async fn close(&self);
}

/// FileStore is a transient SFTP session used for one transfer
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Create `path` and any missing parents; existing directories are fine
    async fn create_dir_all(&self, path: &str) -> Result<(), DeployError>;

    /// Upload `local` to `remote` byte for byte, returning the bytes written
    async fn put(&self, local: &Path, remote: &str) -> Result<u64, DeployError>;

    /// Download `remote` into `local`, returning the bytes read
    async fn get(&self, remote: &str, local: &Path) -> Result<u64, DeployError>;

    /// Close the SFTP session; errors are swallowed
    async fn close(&self);
}

/// Join remote POSIX path segments without doubling separators
pub fn remote_join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Parent directory of a remote POSIX path
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
