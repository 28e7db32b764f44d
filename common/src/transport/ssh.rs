// SSH/SFTP transport backed by libssh2
// Blocking ssh2 calls run on the blocking thread pool

use super::{remote_parent, Connection, Connector, FileStore};
use crate::errors::DeployError;
use crate::models::{CommandResult, Credential, RemoteTarget};
use crate::retry::{retry_transient, FixedDelay};
use async_trait::async_trait;
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Run a blocking closure on the blocking pool and flatten the join error
async fn blocking<T, F>(f: F) -> Result<T, DeployError>
where
    F: FnOnce() -> Result<T, DeployError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Ssh2Connector opens password-authenticated SSH connections
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
    io_timeout: Duration,
    retry: FixedDelay,
}

impl Ssh2Connector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
            retry: FixedDelay::none(),
        }
    }

    /// Retry TCP-level connect failures; authentication is never retried
    pub fn with_retry(mut self, retry: FixedDelay) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    #[instrument(skip(self, target, credential), fields(host = %target.host, port = %target.port))]
    async fn connect(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, DeployError> {
        let connection = retry_transient(&self.retry, || {
            let target = target.clone();
            let credential = credential.clone();
            let connect_timeout = self.connect_timeout;
            let io_timeout = self.io_timeout;
            blocking(move || open_session(&target, &credential, connect_timeout, io_timeout))
        })
        .await?;
        Ok(Arc::new(connection))
    }
}

fn open_session(
    target: &RemoteTarget,
    credential: &Credential,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<Ssh2Connection, DeployError> {
    let label = target.session_key().to_string();
    info!(target = %label, username = %target.username, "Establishing SSH connection");

    let connection_error = |reason: String| DeployError::Connection {
        target: label.clone(),
        reason,
    };
    let auth_error = |reason: String| DeployError::Auth {
        target: label.clone(),
        reason,
    };

    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connection_error(format!("Failed to resolve host: {}", e)))?;

    let mut last_error = None;
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "TCP connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    let tcp = stream.ok_or_else(|| {
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "host resolved to no addresses".to_string());
        error!(target = %label, reason = %reason, "Failed to connect");
        connection_error(format!("Failed to connect: {}", reason))
    })?;

    // Set timeouts
    tcp.set_read_timeout(Some(io_timeout))
        .map_err(|e| connection_error(format!("Failed to set read timeout: {}", e)))?;
    tcp.set_write_timeout(Some(io_timeout))
        .map_err(|e| connection_error(format!("Failed to set write timeout: {}", e)))?;

    let mut session = Session::new()
        .map_err(|e| connection_error(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(io_timeout.as_millis().min(u32::MAX as u128) as u32);

    session.handshake().map_err(|e| {
        error!(error = %e, "SSH handshake failed");
        auth_error(format!("SSH handshake failed: {}", e))
    })?;

    log_host_key(&session);

    session
        .userauth_password(&target.username, credential.expose())
        .map_err(|e| {
            error!(error = %e, username = %target.username, "Password authentication failed");
            auth_error(format!(
                "Password authentication failed for user {}: {}",
                target.username, e
            ))
        })?;

    if !session.authenticated() {
        return Err(auth_error("Authentication failed".to_string()));
    }

    info!(target = %label, "SSH connection established successfully");
    Ok(Ssh2Connection { session, label })
}

fn log_host_key(session: &Session) {
    if let Some((_, key_type)) = session.host_key() {
        if let Some(hash) = session.host_key_hash(ssh2::HashType::Sha256) {
            let fingerprint = hash
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":");
            info!(host_key_type = ?key_type, fingerprint = %fingerprint, "Host key received");
        }
    }
}

/// Ssh2Connection wraps an authenticated libssh2 session
pub struct Ssh2Connection {
    session: Session,
    label: String,
}

#[async_trait]
impl Connection for Ssh2Connection {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandResult, DeployError> {
        let session = self.session.clone();
        let label = self.label.clone();
        let command = command.to_string();
        let stdin = stdin.map(str::to_string);
        blocking(move || run_channel(&session, &label, &command, stdin.as_deref())).await
    }

    async fn open_file_store(&self) -> Result<Box<dyn FileStore>, DeployError> {
        let session = self.session.clone();
        let label = self.label.clone();
        let sftp = blocking(move || {
            session.sftp().map_err(|e| DeployError::Connection {
                target: label,
                reason: format!("Failed to open SFTP channel: {}", e),
            })
        })
        .await?;

        Ok(Box::new(Ssh2FileStore {
            sftp: Arc::new(Mutex::new(Some(sftp))),
            label: self.label.clone(),
        }))
    }

    async fn close(&self) {
        let session = self.session.clone();
        let label = self.label.clone();
        let _ = blocking(move || {
            if let Err(e) = session.disconnect(None, "deployment finished", None) {
                debug!(target = %label, error = %e, "Disconnect failed, ignoring");
            }
            Ok(())
        })
        .await;
    }
}

fn run_channel(
    session: &Session,
    label: &str,
    command: &str,
    stdin: Option<&str>,
) -> Result<CommandResult, DeployError> {
    let channel_error = |reason: String| DeployError::Connection {
        target: label.to_string(),
        reason,
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| channel_error(format!("Channel open failed: {}", e)))?;
    // Input goes through a plain pipe: a PTY never delivers EOF, and sudo
    // would wait for a second attempt after a rejected password
    if stdin.is_none() {
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| channel_error(format!("PTY request failed: {}", e)))?;
    }
    channel
        .exec(command)
        .map_err(|e| channel_error(format!("Exec failed: {}", e)))?;

    if let Some(input) = stdin {
        channel
            .write_all(input.as_bytes())
            .and_then(|_| channel.write_all(b"\n"))
            .and_then(|_| channel.flush())
            .map_err(|e| channel_error(format!("Failed to write stdin: {}", e)))?;
        channel
            .send_eof()
            .map_err(|e| channel_error(format!("Failed to close stdin: {}", e)))?;
    }

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| channel_error(format!("Failed to read stdout: {}", e)))?;
    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| channel_error(format!("Failed to read stderr: {}", e)))?;

    channel
        .wait_close()
        .map_err(|e| channel_error(format!("Channel close failed: {}", e)))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| channel_error(format!("Exit status unavailable: {}", e)))?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

/// Ssh2FileStore is one SFTP channel; `close` drops it
struct Ssh2FileStore {
    sftp: Arc<Mutex<Option<Sftp>>>,
    label: String,
}

impl Ssh2FileStore {
    async fn with_sftp<T, F>(&self, f: F) -> Result<T, DeployError>
    where
        F: FnOnce(&Sftp) -> Result<T, DeployError> + Send + 'static,
        T: Send + 'static,
    {
        let sftp = Arc::clone(&self.sftp);
        blocking(move || {
            let guard = sftp
                .lock()
                .map_err(|_| DeployError::Transfer("SFTP session lock poisoned".to_string()))?;
            match guard.as_ref() {
                Some(sftp) => f(sftp),
                None => Err(DeployError::Transfer("SFTP session already closed".to_string())),
            }
        })
        .await
    }
}

#[async_trait]
impl FileStore for Ssh2FileStore {
    #[instrument(skip(self), fields(target = %self.label))]
    async fn create_dir_all(&self, path: &str) -> Result<(), DeployError> {
        let path = path.to_string();
        self.with_sftp(move |sftp| create_remote_directory(sftp, &path))
            .await
    }

    #[instrument(skip(self), fields(target = %self.label))]
    async fn put(&self, local: &Path, remote: &str) -> Result<u64, DeployError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_sftp(move |sftp| {
            let mut source = File::open(&local)?;
            let mut remote_file = sftp.create(Path::new(&remote)).map_err(|e| {
                error!(error = %e, remote_path = %remote, "Failed to create remote file");
                DeployError::Transfer(format!("Failed to create remote file {}: {}", remote, e))
            })?;
            let written = std::io::copy(&mut source, &mut remote_file).map_err(|e| {
                DeployError::Transfer(format!("Failed to write {}: {}", remote, e))
            })?;
            remote_file
                .flush()
                .map_err(|e| DeployError::Transfer(format!("Failed to flush {}: {}", remote, e)))?;
            debug!(remote_path = %remote, bytes = written, "File uploaded");
            Ok(written)
        })
        .await
    }

    #[instrument(skip(self), fields(target = %self.label))]
    async fn get(&self, remote: &str, local: &Path) -> Result<u64, DeployError> {
        let local: PathBuf = local.to_path_buf();
        let remote = remote.to_string();
        self.with_sftp(move |sftp| {
            let mut remote_file = sftp.open(Path::new(&remote)).map_err(|e| {
                DeployError::Transfer(format!("Failed to open remote file {}: {}", remote, e))
            })?;
            let mut sink = File::create(&local)?;
            let read = std::io::copy(&mut remote_file, &mut sink).map_err(|e| {
                DeployError::Transfer(format!("Failed to read {}: {}", remote, e))
            })?;
            sink.flush()?;
            Ok(read)
        })
        .await
    }

    async fn close(&self) {
        let sftp = Arc::clone(&self.sftp);
        let _ = blocking(move || {
            if let Ok(mut guard) = sftp.lock() {
                guard.take();
            }
            Ok(())
        })
        .await;
    }
}

/// Create remote directory recursively
fn create_remote_directory(sftp: &Sftp, dir_path: &str) -> Result<(), DeployError> {
    // Check if directory already exists
    if sftp.stat(Path::new(dir_path)).is_ok() {
        return Ok(());
    }

    // Create parent directories first
    if let Some(parent) = remote_parent(dir_path) {
        if parent != "/" && parent != dir_path {
            create_remote_directory(sftp, parent)?;
        }
    }

    debug!(dir_path = %dir_path, "Creating directory");
    match sftp.mkdir(Path::new(dir_path), 0o755) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Ignore error if directory already exists (race condition)
            if sftp.stat(Path::new(dir_path)).is_ok() {
                Ok(())
            } else {
                error!(error = %e, dir_path = %dir_path, "Failed to create directory");
                Err(DeployError::Transfer(format!(
                    "Failed to create directory {}: {}",
                    dir_path, e
                )))
            }
        }
    }
}
