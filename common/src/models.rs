// Data models for remote targets, commands and workflow runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// RemoteTarget describes one host of the fleet and the paths used on it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Directory receiving uploads
    pub upload_root: String,
    /// Directory uploaded content is installed into, when the workflow needs one
    pub install_root: Option<String>,
}

impl RemoteTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        upload_root: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            upload_root: upload_root.into(),
            install_root: None,
        }
    }

    pub fn with_install_root(mut self, install_root: Option<String>) -> Self {
        self.install_root = install_root;
        self
    }

    /// Identity used for session caching
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            host: self.host.trim().to_ascii_lowercase(),
            port: self.port,
        }
    }

    /// Privileged commands need no escalation when logged in as root
    pub fn is_root(&self) -> bool {
        self.username == "root"
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// SessionKey identifies a cached session: (host, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credential holds a password in memory only; it is never serialized or logged
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.secret
    }

    /// Replace every occurrence of the secret in `text`
    pub fn redact(&self, text: &str) -> String {
        if self.secret.is_empty() {
            return text.to_string();
        }
        text.replace(&self.secret, "********")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(********)")
    }
}

/// RemoteCommand is an opaque shell line, optionally run with elevated privileges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub line: String,
    pub privileged: bool,
}

impl RemoteCommand {
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            privileged: false,
        }
    }

    pub fn privileged(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            privileged: true,
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            write!(f, "[sudo] {}", self.line)
        } else {
            f.write_str(&self.line)
        }
    }
}

/// CommandResult captures one remote invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Criticality decides whether a failed step aborts its workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Fatal,
    BestEffort,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criticality::Fatal => write!(f, "fatal"),
            Criticality::BestEffort => write!(f, "best_effort"),
        }
    }
}

/// WorkflowStatus represents the lifecycle of a workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "aborted" => Ok(WorkflowStatus::Aborted),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// StepStatus represents the outcome of a single workflow step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    /// A FATAL step failed and aborted the workflow
    Failed,
    /// A BEST_EFFORT step failed and the workflow continued
    Suppressed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Suppressed => write!(f, "suppressed"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "suppressed" => Ok(StepStatus::Suppressed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// StepRecord is the run-time trace of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub description: String,
    pub criticality: Criticality,
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// WorkflowReport summarises a workflow run, complete or aborted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub target: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowReport {
    pub fn new(workflow: &str, target: &RemoteTarget) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            target: target.to_string(),
            status: WorkflowStatus::Pending,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Steps whose failure was logged and swallowed
    pub fn suppressed(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Suppressed)
    }

    pub fn attempted_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_ignores_case_and_roles() {
        let a = RemoteTarget::new("Cabinet.local", 2222, "ops", "/home/ops");
        let b = RemoteTarget::new("cabinet.local", 2222, "ops", "/opt/other")
            .with_install_root(Some("/opt/app".to_string()));
        assert_eq!(a.session_key(), b.session_key());
        assert_ne!(
            a.session_key(),
            RemoteTarget::new("cabinet.local", 22, "ops", "/home/ops").session_key()
        );
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("s3cret");
        assert_eq!(format!("{:?}", credential), "Credential(********)");
        assert_eq!(
            credential.redact("[sudo] password: s3cret\nok"),
            "[sudo] password: ********\nok"
        );
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Suppressed,
        ] {
            assert_eq!(status.to_string().parse::<StepStatus>(), Ok(status));
        }
        assert!("done".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_report_serializes_with_snake_case_statuses() {
        let target = RemoteTarget::new("172.30.35.203", 2222, "qingshan", "/home/qingshan");
        let mut report = WorkflowReport::new("smart-cabinet", &target);
        report.steps.push(StepRecord {
            index: 0,
            description: "Remove uploaded package".to_string(),
            criticality: Criticality::BestEffort,
            status: StepStatus::Suppressed,
            error: Some("exit 1".to_string()),
            started_at: None,
            completed_at: None,
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["target"], "qingshan@172.30.35.203:2222");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["steps"][0]["criticality"], "best_effort");
        assert_eq!(json["steps"][0]["status"], "suppressed");
        assert_eq!(report.suppressed().count(), 1);
    }

    #[test]
    fn test_target_display() {
        let target = RemoteTarget::new("192.168.1.50", 22, "root", "/opt/update");
        assert_eq!(target.to_string(), "root@192.168.1.50:22");
        assert!(target.is_root());
    }
}
