// In-memory remote host used by the integration tests
// Remote filesystem map, scripted command responses and connection counters

#![allow(dead_code)]

use async_trait::async_trait;
use common::errors::DeployError;
use common::models::{CommandResult, Credential, RemoteTarget};
use common::transport::{Connection, Connector, CredentialProvider, FileStore};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Fake remote host
// ============================================================================

#[derive(Default)]
pub struct FakeRemote {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<BTreeSet<String>>,
    responses: Mutex<Vec<(String, CommandResult)>>,
    commands: Mutex<Vec<(String, Option<String>)>>,
    truncate_suffix: Mutex<Option<String>>,
    failing_put_suffix: Mutex<Option<String>>,
    unreachable: AtomicBool,
    store_closes: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` answer with `stdout` and `exit_code`
    pub fn respond(&self, pattern: &str, stdout: &str, exit_code: i32) {
        self.responses.lock().unwrap().push((
            pattern.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("{} failed", pattern)
                },
                exit_code,
            },
        ));
    }

    /// Commands containing `pattern` fail with `exit_code` and the given stderr
    pub fn respond_with_stderr(&self, pattern: &str, stderr: &str, exit_code: i32) {
        self.responses.lock().unwrap().push((
            pattern.to_string(),
            CommandResult {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        ));
    }

    /// Fail every upload whose path ends with `suffix`
    pub fn fail_puts_ending_with(&self, suffix: &str) {
        *self.failing_put_suffix.lock().unwrap() = Some(suffix.to_string());
    }

    /// While set, existing connections behave like a host that went away
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn store_closes(&self) -> usize {
        self.store_closes.load(Ordering::SeqCst)
    }

    /// Drop the last byte of every uploaded file whose path ends with `suffix`
    pub fn truncate_uploads_ending_with(&self, suffix: &str) {
        *self.truncate_suffix.lock().unwrap() = Some(suffix.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }

    pub fn stdin_of(&self, pattern: &str) -> Option<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .find(|(line, _)| line.contains(pattern))
            .and_then(|(_, stdin)| stdin.clone())
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn exec(&self, line: &str, stdin: Option<&str>) -> CommandResult {
        self.commands
            .lock()
            .unwrap()
            .push((line.to_string(), stdin.map(str::to_string)));
        self.responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Connector / Connection / FileStore
// ============================================================================

pub struct FakeConnector {
    remote: Arc<FakeRemote>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    accepted_secret: String,
}

impl FakeConnector {
    pub fn new(remote: Arc<FakeRemote>) -> Arc<Self> {
        Self::accepting(remote, "secret")
    }

    pub fn accepting(remote: Arc<FakeRemote>, secret: &str) -> Arc<Self> {
        Arc::new(Self {
            remote,
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            accepted_secret: secret.to_string(),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, DeployError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if credential.expose() != self.accepted_secret {
            return Err(DeployError::Auth {
                target: target.session_key().to_string(),
                reason: "Permission denied".to_string(),
            });
        }
        Ok(Arc::new(FakeConnection {
            remote: Arc::clone(&self.remote),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct FakeConnection {
    remote: Arc<FakeRemote>,
    closes: Arc<AtomicUsize>,
}

impl FakeConnection {
    fn reachable(&self) -> Result<(), DeployError> {
        if self.remote.unreachable.load(Ordering::SeqCst) {
            return Err(DeployError::Connection {
                target: "fake".to_string(),
                reason: "Connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandResult, DeployError> {
        self.reachable()?;
        Ok(self.remote.exec(command, stdin))
    }

    async fn open_file_store(&self) -> Result<Box<dyn FileStore>, DeployError> {
        self.reachable()?;
        Ok(Box::new(FakeStore {
            remote: Arc::clone(&self.remote),
        }))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeStore {
    remote: Arc<FakeRemote>,
}

#[async_trait]
impl FileStore for FakeStore {
    async fn create_dir_all(&self, path: &str) -> Result<(), DeployError> {
        self.remote.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<u64, DeployError> {
        let fail = self
            .remote
            .failing_put_suffix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|suffix| remote.ends_with(suffix.as_str()));
        if fail {
            return Err(DeployError::Transfer(format!("Failed to write {}", remote)));
        }
        let mut bytes = std::fs::read(local)?;
        let written = bytes.len() as u64;
        let truncate = self
            .remote
            .truncate_suffix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|suffix| remote.ends_with(suffix.as_str()));
        if truncate {
            bytes.pop();
        }
        self.remote
            .files
            .lock()
            .unwrap()
            .insert(remote.to_string(), bytes);
        Ok(written)
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<u64, DeployError> {
        let bytes = self
            .remote
            .file(remote)
            .ok_or_else(|| DeployError::Transfer(format!("no such file: {}", remote)))?;
        std::fs::write(local, &bytes)?;
        Ok(bytes.len() as u64)
    }

    async fn close(&self) {
        self.remote.store_closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Credential prompt
// ============================================================================

/// Hands out scripted answers, then repeats the last one
pub struct CountingPrompt {
    answers: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    prompts: AtomicUsize,
}

impl CountingPrompt {
    pub fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            last: Mutex::new("secret".to_string()),
            prompts: AtomicUsize::new(0),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(&["secret"])
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for CountingPrompt {
    async fn credential(&self, _target: &RemoteTarget) -> Result<Credential, DeployError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let next = self.answers.lock().unwrap().pop_front();
        let answer = match next {
            Some(answer) => {
                *self.last.lock().unwrap() = answer.clone();
                answer
            }
            None => self.last.lock().unwrap().clone(),
        };
        Ok(Credential::new(answer))
    }
}

// ============================================================================
// Targets
// ============================================================================

pub fn cabinet() -> RemoteTarget {
    RemoteTarget::new("172.30.35.203", 2222, "qingshan", "/home/qingshan")
}

pub fn server() -> RemoteTarget {
    RemoteTarget::new("192.168.1.50", 22, "root", "/opt/hjrich/smart-cabinet/cabinet-server-update")
        .with_install_root(Some("/opt/hjrich/smart-cabinet/cabinet-server".to_string()))
}
