// Error handling framework
// Failure taxonomy for transfers, remote commands and upgrade workflows

use crate::models::WorkflowReport;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the remote execution and transfer layer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Authentication failed for {target}: {reason}")]
    Auth { target: String, reason: String },

    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("Integrity check failed for {}: local digest {local}, remote digest {remote}", .path.display())]
    Integrity {
        path: PathBuf,
        local: String,
        remote: String,
    },

    #[error("Remote command exited with code {exit_code}: {command}{}", render_output(.stderr, .stdout))]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("Required artifact not found: {0}")]
    NotFound(String),

    #[error("Installed version of {package} is {installed}, expected {expected}")]
    VersionMismatch {
        package: String,
        expected: String,
        installed: String,
    },

    #[error("Verification failed: expected `{expected}` in output of `{command}`")]
    Verification { command: String, expected: String },

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_output(stderr: &str, stdout: &str) -> String {
    // A pseudo-terminal merges stderr into stdout, fall back to the tail of stdout
    let text = if stderr.trim().is_empty() {
        tail(stdout, 20)
    } else {
        stderr.trim().to_string()
    };
    if text.is_empty() {
        String::new()
    } else {
        format!("\n{}", text)
    }
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.trim().lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

impl DeployError {
    /// Transport-level failures are the only kind worth a second connect attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Connection { .. })
    }

    /// Short machine-friendly label, used as a metrics dimension
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Auth { .. } => "auth",
            DeployError::Connection { .. } => "connection",
            DeployError::Integrity { .. } => "integrity",
            DeployError::Command { .. } => "command",
            DeployError::NotFound(_) => "not_found",
            DeployError::VersionMismatch { .. } => "version_mismatch",
            DeployError::Verification { .. } => "verification",
            DeployError::Transfer(_) => "transfer",
            DeployError::Config(_) => "config",
            DeployError::Io(_) => "io",
        }
    }
}

impl From<walkdir::Error> for DeployError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => DeployError::Io(io),
            None => DeployError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "filesystem loop detected while walking directory",
            )),
        }
    }
}

impl From<config::ConfigError> for DeployError {
    fn from(err: config::ConfigError) -> Self {
        DeployError::Config(err.to_string())
    }
}

/// Workflow-level failures
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Raised before any network activity, typically a missing local artifact
    #[error("Workflow '{workflow}' could not be planned: {source}")]
    Planning {
        workflow: String,
        #[source]
        source: DeployError,
    },

    /// A FATAL step failed; no further steps were attempted
    #[error("Workflow '{workflow}' aborted at step {} ({step}): {source}", .step_index + 1)]
    Aborted {
        workflow: String,
        step_index: usize,
        step: String,
        #[source]
        source: DeployError,
        report: Box<WorkflowReport>,
    },
}

impl WorkflowError {
    /// The underlying transfer/command failure
    pub fn cause(&self) -> &DeployError {
        match self {
            WorkflowError::Planning { source, .. } | WorkflowError::Aborted { source, .. } => source,
        }
    }

    /// Partial run report, present once at least the engine has started
    pub fn report(&self) -> Option<&WorkflowReport> {
        match self {
            WorkflowError::Aborted { report, .. } => Some(report),
            WorkflowError::Planning { .. } => None,
        }
    }
}
