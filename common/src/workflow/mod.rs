// Upgrade workflows
// A workflow is an ordered list of transfer and command steps against one target

pub mod artifact;
mod catalog;
mod engine;

pub use catalog::{Package, WorkflowCatalog, WorkflowKind};
pub use engine::WorkflowEngine;

use crate::models::{Criticality, RemoteCommand, RemoteTarget};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// StepAction is what a workflow step does on the target
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Upload one file into `remote_dir`, verified by read-back
    UploadFile { local: PathBuf, remote_dir: String },

    /// Upload a directory's contents into `remote_root`, verified per file
    UploadDirectory { local: PathBuf, remote_root: String },

    Command(RemoteCommand),

    /// Run `stop` only when `probe` prints something
    StopIfRunning {
        probe: RemoteCommand,
        stop: RemoteCommand,
    },

    /// Wait `settle`, then require `expected_token` in the command output
    VerifyStatus {
        command: RemoteCommand,
        expected_token: String,
        settle: Duration,
    },

    /// Require the command output (trimmed) to equal `expected`
    VerifyVersion {
        command: RemoteCommand,
        package: String,
        expected: String,
    },

    /// Require every expected line to appear in the command output
    VerifyContains {
        command: RemoteCommand,
        expected_lines: Vec<String>,
    },

    /// Fire a reboot command without observing its outcome
    ///
    /// The call is awaited for at most `fire_window`; success, failure and
    /// timeout are all logged and suppressed.
    ScheduleReboot {
        command: RemoteCommand,
        fire_window: Duration,
    },
}

/// WorkflowStep pairs an action with its criticality
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub description: String,
    pub action: StepAction,
    pub criticality: Criticality,
}

impl WorkflowStep {
    pub fn fatal(description: impl Into<String>, action: StepAction) -> Self {
        Self {
            description: description.into(),
            action,
            criticality: Criticality::Fatal,
        }
    }

    pub fn best_effort(description: impl Into<String>, action: StepAction) -> Self {
        Self {
            description: description.into(),
            action,
            criticality: Criticality::BestEffort,
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.description, self.criticality)
    }
}

/// Workflow is a named, ordered step list bound to one target
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub target: RemoteTarget,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, target: RemoteTarget) -> Self {
        Self {
            name: name.into(),
            target,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }
}
