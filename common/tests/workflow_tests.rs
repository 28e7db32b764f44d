// Workflow engine tests
// Step criticality, fail-fast planning and post-install verification

mod support;

use common::config::Settings;
use common::errors::{DeployError, WorkflowError};
use common::executor::RemoteExecutor;
use common::models::{RemoteCommand, StepStatus, WorkflowStatus};
use common::orchestrator::Orchestrator;
use common::transfer::TransferService;
use common::transport::SessionRegistry;
use common::workflow::{
    Package, StepAction, Workflow, WorkflowEngine, WorkflowKind, WorkflowStep,
};
use std::fs;
use std::sync::Arc;
use support::{cabinet, CountingPrompt, FakeConnector, FakeRemote};
use tempfile::TempDir;

fn engine_for(connector: &Arc<FakeConnector>) -> WorkflowEngine {
    let registry = Arc::new(SessionRegistry::new(
        connector.clone(),
        CountingPrompt::accepting(),
    ));
    WorkflowEngine::new(
        Arc::new(TransferService::new(registry.clone())),
        Arc::new(RemoteExecutor::new(registry)),
    )
}

fn command(line: &str) -> StepAction {
    StepAction::Command(RemoteCommand::plain(line))
}

fn settings_in(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.paths.artifact_dir = dir.path().to_path_buf();
    settings.workflow.settle_delay_seconds = 0;
    settings
}

#[tokio::test]
async fn test_best_effort_failure_continues_and_fatal_failure_aborts() {
    let remote = FakeRemote::new();
    remote.respond("step-2", "", 1);
    remote.respond("step-4", "", 2);
    let connector = FakeConnector::new(remote.clone());

    let workflow = Workflow::new("criticality", cabinet())
        .step(WorkflowStep::fatal("first", command("step-1")))
        .step(WorkflowStep::best_effort("second", command("step-2")))
        .step(WorkflowStep::fatal("third", command("step-3")))
        .step(WorkflowStep::fatal("fourth", command("step-4")))
        .step(WorkflowStep::fatal("fifth", command("step-5")));

    let err = engine_for(&connector).run(&workflow).await.unwrap_err();

    assert_eq!(remote.commands(), vec!["step-1", "step-2", "step-3", "step-4"]);
    match &err {
        WorkflowError::Aborted {
            step_index,
            step,
            source,
            report,
            ..
        } => {
            assert_eq!(*step_index, 3);
            assert_eq!(step, "fourth");
            assert!(matches!(source, DeployError::Command { exit_code: 2, .. }));

            let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
            assert_eq!(
                statuses,
                vec![
                    StepStatus::Succeeded,
                    StepStatus::Suppressed,
                    StepStatus::Succeeded,
                    StepStatus::Failed,
                    StepStatus::Pending,
                ]
            );
            assert_eq!(report.status, WorkflowStatus::Aborted);
            assert_eq!(report.attempted_steps(), 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("step 4 (fourth)"));
}

#[tokio::test]
async fn test_missing_package_fails_before_any_network_activity() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("smart_cabinet_latest.deb"), b"deb").unwrap();
    let connector = FakeConnector::new(FakeRemote::new());
    let prompt = CountingPrompt::accepting();
    let orchestrator =
        Orchestrator::with_connector(settings_in(&dir), connector.clone(), prompt.clone());

    let err = orchestrator
        .run(WorkflowKind::DevicePackage(Package::SmartCabinet))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Planning { .. }));
    assert!(matches!(err.cause(), DeployError::NotFound(_)));
    assert_eq!(connector.connects(), 0);
    assert_eq!(prompt.prompts(), 0);
    assert_eq!(orchestrator.registry().handshake_count(), 0);
}

#[tokio::test]
async fn test_installed_version_must_match_package_version() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("smart_cabinet_1.2.4.deb"), b"deb payload").unwrap();
    let remote = FakeRemote::new();
    remote.respond("dpkg-query", "1.2.3\r\n", 0);
    let connector = FakeConnector::new(remote.clone());
    let orchestrator = Orchestrator::with_connector(
        settings_in(&dir),
        connector,
        CountingPrompt::accepting(),
    );

    let err = orchestrator
        .run(WorkflowKind::DevicePackage(Package::SmartCabinet))
        .await
        .unwrap_err();

    match err.cause() {
        DeployError::VersionMismatch {
            package,
            expected,
            installed,
        } => {
            assert_eq!(package, "smart-cabinet");
            assert_eq!(expected, "1.2.4");
            assert_eq!(installed, "1.2.3");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The install ran, nothing after the failed verification did
    assert!(remote.commands().iter().any(|c| c.contains("dpkg -i")));
    assert!(!remote.commands().iter().any(|c| c.contains("shutdown -r")));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_matching_version_completes_and_schedules_reboot() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("smart_cabinet_1.2.4.deb"), b"deb payload").unwrap();
    let remote = FakeRemote::new();
    remote.respond("dpkg-query", "1.2.4", 0);
    let connector = FakeConnector::new(remote.clone());
    let orchestrator = Orchestrator::with_connector(
        settings_in(&dir),
        connector.clone(),
        CountingPrompt::accepting(),
    );

    let report = orchestrator
        .run(WorkflowKind::DevicePackage(Package::SmartCabinet))
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(
        remote.file("/home/qingshan/smart_cabinet_1.2.4.deb"),
        Some(b"deb payload".to_vec())
    );
    let commands = remote.commands();
    assert!(commands.iter().any(|c| c.contains("rm -f '/home/qingshan/smart_cabinet_1.2.4.deb'")));
    assert!(commands.last().unwrap().contains("shutdown -r +1"));
    // Transfer and commands went over one session
    assert_eq!(connector.connects(), 1);

    orchestrator.shutdown().await;
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn test_backend_service_verifies_active_marker() {
    let dir = TempDir::new().unwrap();
    let backend = dir.path().join("cabinet-server-update");
    fs::create_dir_all(backend.join("lib")).unwrap();
    fs::write(backend.join("cabinet-server.jar"), b"jar").unwrap();
    fs::write(backend.join("lib/dep.jar"), b"dep").unwrap();

    let remote = FakeRemote::new();
    remote.respond(
        "systemctl status",
        "Cabinet.service - Cabinet\r\n   Active: active (running) since Mon\r\n",
        0,
    );
    let connector = FakeConnector::new(remote.clone());
    let orchestrator = Orchestrator::with_connector(
        settings_in(&dir),
        connector,
        CountingPrompt::accepting(),
    );

    let report = orchestrator.run(WorkflowKind::BackendService).await.unwrap();
    assert_eq!(report.steps.len(), 5);
    assert_eq!(
        remote.commands(),
        vec![
            "systemctl stop Cabinet.service",
            "cp -rf /opt/hjrich/smart-cabinet/cabinet-server-update/* /opt/hjrich/smart-cabinet/cabinet-server/",
            "systemctl start Cabinet.service",
            "systemctl status Cabinet.service --no-pager",
        ]
    );
    assert!(remote
        .file("/opt/hjrich/smart-cabinet/cabinet-server-update/lib/dep.jar")
        .is_some());
}

#[tokio::test]
async fn test_inactive_service_aborts_backend_update() {
    let dir = TempDir::new().unwrap();
    let backend = dir.path().join("cabinet-server-update");
    fs::create_dir_all(&backend).unwrap();
    fs::write(backend.join("cabinet-server.jar"), b"jar").unwrap();

    let remote = FakeRemote::new();
    remote.respond("systemctl status", "   Active: failed (Result: exit-code)\r\n", 3);
    let orchestrator = Orchestrator::with_connector(
        settings_in(&dir),
        FakeConnector::new(remote),
        CountingPrompt::accepting(),
    );

    let err = orchestrator
        .run(WorkflowKind::BackendService)
        .await
        .unwrap_err();
    assert!(matches!(err.cause(), DeployError::Verification { .. }));
    assert!(matches!(err, WorkflowError::Aborted { step_index: 4, .. }));
}

#[tokio::test]
async fn test_access_door_stop_is_skipped_when_not_running() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("access_door_2.0.1.deb"), b"door").unwrap();
    let remote = FakeRemote::new();
    remote.respond("dpkg-query", "2.0.1", 0);
    let mut settings = settings_in(&dir);
    settings.workflow.reboot_after_device_update = false;
    let orchestrator = Orchestrator::with_connector(
        settings,
        FakeConnector::new(remote.clone()),
        CountingPrompt::accepting(),
    );

    orchestrator
        .run(WorkflowKind::DevicePackage(Package::AccessDoor))
        .await
        .unwrap();

    let commands = remote.commands();
    assert!(commands[0].starts_with("ps -ef | grep access-door"));
    assert!(!commands.iter().any(|c| c.contains("systemctl stop access-door")));
}
