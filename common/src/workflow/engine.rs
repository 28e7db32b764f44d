// Workflow engine - runs workflow steps strictly in order
// FATAL failures abort the run, BEST_EFFORT failures are logged and swallowed

use super::{StepAction, Workflow, WorkflowStep};
use crate::errors::{DeployError, WorkflowError};
use crate::executor::CommandRunner;
use crate::models::{
    Criticality, RemoteCommand, RemoteTarget, StepRecord, StepStatus, WorkflowReport,
    WorkflowStatus,
};
use crate::telemetry;
use crate::transfer::FileTransfer;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

/// Exit codes of a status query that still carry a readable status
const STATUS_EXIT_CODES: [i32; 2] = [3, 4];

/// Workflow engine drives transfers and commands for one workflow at a time
pub struct WorkflowEngine {
    transfer: Arc<dyn FileTransfer>,
    runner: Arc<dyn CommandRunner>,
}

impl WorkflowEngine {
    pub fn new(transfer: Arc<dyn FileTransfer>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { transfer, runner }
    }

    /// Execute all workflow steps sequentially
    ///
    /// Returns the run report when every FATAL step succeeded. The first FATAL
    /// failure stops the run; the error names the step and carries the
    /// partial report.
    #[instrument(skip(self, workflow), fields(workflow = %workflow.name, target = %workflow.target))]
    pub async fn run(&self, workflow: &Workflow) -> Result<WorkflowReport, WorkflowError> {
        let started = Instant::now();
        let mut report = WorkflowReport::new(&workflow.name, &workflow.target);
        report.steps = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepRecord {
                index,
                description: step.description.clone(),
                criticality: step.criticality,
                status: StepStatus::Pending,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();
        report.status = WorkflowStatus::Running;

        info!(
            run_id = %report.run_id,
            step_count = workflow.steps.len(),
            "Starting workflow"
        );

        for (index, step) in workflow.steps.iter().enumerate() {
            info!(step_index = index + 1, step = %step.description, "Executing step");
            report.steps[index].status = StepStatus::Running;
            report.steps[index].started_at = Some(Utc::now());

            let outcome = self.execute_step(&workflow.target, step).await;
            report.steps[index].completed_at = Some(Utc::now());

            match outcome {
                Ok(()) => {
                    info!(outcome = "success", step = %step.description, "Step completed");
                    report.steps[index].status = StepStatus::Succeeded;
                }
                Err(e) if step.criticality == Criticality::BestEffort => {
                    warn!(
                        step = %step.description,
                        error = %e,
                        "Best-effort step failed, continuing"
                    );
                    report.steps[index].status = StepStatus::Suppressed;
                    report.steps[index].error = Some(e.to_string());
                    telemetry::record_step_suppressed(&workflow.name);
                }
                Err(e) => {
                    error!(step = %step.description, error = %e, "Fatal step failed, aborting workflow");
                    report.steps[index].status = StepStatus::Failed;
                    report.steps[index].error = Some(e.to_string());
                    report.status = WorkflowStatus::Aborted;
                    report.completed_at = Some(Utc::now());

                    telemetry::record_workflow_failure(&workflow.name, e.kind());
                    telemetry::record_workflow_duration(
                        &workflow.name,
                        started.elapsed().as_secs_f64(),
                    );
                    return Err(WorkflowError::Aborted {
                        workflow: workflow.name.clone(),
                        step_index: index,
                        step: step.description.clone(),
                        source: e,
                        report: Box::new(report),
                    });
                }
            }
        }

        report.status = WorkflowStatus::Completed;
        report.completed_at = Some(Utc::now());
        telemetry::record_workflow_success(&workflow.name);
        telemetry::record_workflow_duration(&workflow.name, started.elapsed().as_secs_f64());

        info!(
            outcome = "success",
            run_id = %report.run_id,
            suppressed = report.suppressed().count(),
            "Workflow completed"
        );
        Ok(report)
    }

    async fn execute_step(
        &self,
        target: &RemoteTarget,
        step: &WorkflowStep,
    ) -> Result<(), DeployError> {
        match &step.action {
            StepAction::UploadFile { local, remote_dir } => {
                self.transfer.upload_file(local, target, remote_dir).await?;
                Ok(())
            }
            StepAction::UploadDirectory { local, remote_root } => {
                self.transfer
                    .upload_directory(local, target, remote_root)
                    .await?;
                Ok(())
            }
            StepAction::Command(command) => {
                self.runner.run(target, command).await?;
                Ok(())
            }
            StepAction::StopIfRunning { probe, stop } => {
                let output = self.runner.run(target, probe).await?;
                if output.trim().is_empty() {
                    info!("Process not running, nothing to stop");
                    return Ok(());
                }
                warn!("Process is running, stopping it");
                self.runner.run(target, stop).await?;
                Ok(())
            }
            StepAction::VerifyStatus {
                command,
                expected_token,
                settle,
            } => {
                debug!(settle_ms = settle.as_millis() as u64, "Waiting for service to settle");
                sleep(*settle).await;
                let output = self.output_of(target, command).await?;
                if output.contains(expected_token.as_str()) {
                    Ok(())
                } else {
                    Err(DeployError::Verification {
                        command: command.line.clone(),
                        expected: expected_token.clone(),
                    })
                }
            }
            StepAction::VerifyVersion {
                command,
                package,
                expected,
            } => {
                let output = self.runner.run(target, command).await?;
                let installed = output.trim();
                if installed == expected {
                    info!(package = %package, version = %installed, "Installed version verified");
                    Ok(())
                } else {
                    Err(DeployError::VersionMismatch {
                        package: package.clone(),
                        expected: expected.clone(),
                        installed: installed.to_string(),
                    })
                }
            }
            StepAction::VerifyContains {
                command,
                expected_lines,
            } => {
                let output = self.runner.run(target, command).await?;
                let present: Vec<&str> = output.lines().map(str::trim).collect();
                match expected_lines
                    .iter()
                    .find(|line| !present.contains(&line.as_str()))
                {
                    Some(missing) => Err(DeployError::Verification {
                        command: command.line.clone(),
                        expected: missing.clone(),
                    }),
                    None => Ok(()),
                }
            }
            StepAction::ScheduleReboot {
                command,
                fire_window,
            } => {
                self.fire_and_forget(target, command, *fire_window).await;
                Ok(())
            }
        }
    }

    /// Status queries like `systemctl status` exit 3 (inactive) or 4 (unknown
    /// unit); their output is still what gets inspected. Any other failure
    /// propagates unchanged.
    async fn output_of(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<String, DeployError> {
        match self.runner.run(target, command).await {
            Ok(output) => Ok(output),
            Err(DeployError::Command {
                exit_code, stdout, ..
            }) if STATUS_EXIT_CODES.contains(&exit_code) => {
                warn!(exit_code, "Status query reports a stopped unit, inspecting output");
                Ok(stdout)
            }
            Err(e) => Err(e),
        }
    }

    async fn fire_and_forget(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
        fire_window: Duration,
    ) {
        match timeout(fire_window, self.runner.run(target, command)).await {
            Ok(Ok(_)) => info!("Reboot scheduled"),
            Ok(Err(e)) => warn!(error = %e, "Reboot command reported an error, ignoring"),
            Err(_) => debug!("Reboot command still pending, not waiting for it"),
        }
    }
}
