// Workflow catalog
// Parameterized definitions of the fleet's upgrade procedures

use super::artifact::{self, PackageArtifact};
use super::{StepAction, Workflow, WorkflowStep};
use crate::config::Settings;
use crate::errors::{DeployError, WorkflowError};
use crate::executor::shell_quote;
use crate::models::RemoteCommand;
use crate::transport::remote_join;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Installer packages shipped to the cabinet host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Package {
    SmartCabinet,
    AccessDoor,
}

impl Package {
    /// File name prefix, as in `smart_cabinet_1.2.3.deb`
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Package::SmartCabinet => "smart_cabinet",
            Package::AccessDoor => "access_door",
        }
    }

    /// Name known to the remote package database
    pub fn dpkg_name(&self) -> &'static str {
        match self {
            Package::SmartCabinet => "smart-cabinet",
            Package::AccessDoor => "access-door",
        }
    }
}

/// WorkflowKind selects one of the catalog's workflow definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    BackendService,
    DevicePackage(Package),
    DatabaseReinstall,
    DoorConfigPatch,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 5] = [
        WorkflowKind::BackendService,
        WorkflowKind::DevicePackage(Package::SmartCabinet),
        WorkflowKind::DevicePackage(Package::AccessDoor),
        WorkflowKind::DatabaseReinstall,
        WorkflowKind::DoorConfigPatch,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            WorkflowKind::BackendService => "Update the backend service",
            WorkflowKind::DevicePackage(Package::SmartCabinet) => "Update the cabinet program",
            WorkflowKind::DevicePackage(Package::AccessDoor) => "Update the access door program",
            WorkflowKind::DatabaseReinstall => "Reinstall the database",
            WorkflowKind::DoorConfigPatch => "Patch the access door configuration",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowKind::BackendService => write!(f, "backend-service"),
            WorkflowKind::DevicePackage(Package::SmartCabinet) => write!(f, "smart-cabinet"),
            WorkflowKind::DevicePackage(Package::AccessDoor) => write!(f, "access-door"),
            WorkflowKind::DatabaseReinstall => write!(f, "database-reinstall"),
            WorkflowKind::DoorConfigPatch => write!(f, "door-config"),
        }
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| {
                let names: Vec<String> = WorkflowKind::ALL.iter().map(|k| k.to_string()).collect();
                format!("Unknown workflow '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// WorkflowCatalog turns a [`WorkflowKind`] into a concrete step list
///
/// Planning does all local discovery. A missing artifact surfaces as
/// [`WorkflowError::Planning`] before any connection is opened.
pub struct WorkflowCatalog {
    settings: Settings,
}

impl WorkflowCatalog {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn local(&self, folder: &Path) -> PathBuf {
        self.settings.paths.artifact_dir.join(folder)
    }

    /// Workflows whose local artifacts are present, in menu order
    pub fn detect_available(&self) -> Vec<WorkflowKind> {
        WorkflowKind::ALL
            .into_iter()
            .filter(|kind| match self.plan(*kind) {
                Ok(_) => true,
                Err(e) => {
                    debug!(workflow = %kind, reason = %e.cause(), "Workflow not available");
                    false
                }
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub fn plan(&self, kind: WorkflowKind) -> Result<Workflow, WorkflowError> {
        let planned = match kind {
            WorkflowKind::BackendService => self.backend_service(),
            WorkflowKind::DevicePackage(package) => self.device_package(package),
            WorkflowKind::DatabaseReinstall => self.database_reinstall(),
            WorkflowKind::DoorConfigPatch => self.door_config_patch(),
        };
        planned
            .map(|workflow| {
                info!(workflow = %kind, steps = workflow.steps.len(), "Workflow planned");
                workflow
            })
            .map_err(|source| WorkflowError::Planning {
                workflow: kind.to_string(),
                source,
            })
    }

    fn backend_service(&self) -> Result<Workflow, DeployError> {
        let local = self.local(&self.settings.paths.backend_folder);
        artifact::require_directory(&local)?;

        let target = self.settings.targets.server.to_target();
        let install_root = target.install_root.clone().ok_or_else(|| {
            DeployError::Config("targets.server.install_root is required".to_string())
        })?;
        let service = &self.settings.workflow.backend_service;
        let upload_root = target.upload_root.clone();

        Ok(Workflow::new(WorkflowKind::BackendService.to_string(), target)
            .step(WorkflowStep::fatal(
                "Upload backend update",
                StepAction::UploadDirectory {
                    local,
                    remote_root: upload_root.clone(),
                },
            ))
            .step(WorkflowStep::fatal(
                format!("Stop {}", service),
                StepAction::Command(RemoteCommand::privileged(format!(
                    "systemctl stop {}",
                    service
                ))),
            ))
            .step(WorkflowStep::fatal(
                "Copy update into install directory",
                StepAction::Command(RemoteCommand::privileged(format!(
                    "cp -rf {}/* {}/",
                    upload_root.trim_end_matches('/'),
                    install_root.trim_end_matches('/')
                ))),
            ))
            .step(WorkflowStep::fatal(
                format!("Start {}", service),
                StepAction::Command(RemoteCommand::privileged(format!(
                    "systemctl start {}",
                    service
                ))),
            ))
            .step(self.verify_service(service)))
    }

    fn device_package(&self, package: Package) -> Result<Workflow, DeployError> {
        let found = artifact::find_versioned_package(
            &self.settings.paths.artifact_dir,
            package.file_prefix(),
        )?;
        let PackageArtifact {
            path,
            file_name,
            version,
        } = found;

        let target = self.settings.targets.cabinet.to_target();
        let upload_root = target.upload_root.clone();
        let remote_package = remote_join(&upload_root, &file_name);
        let kind = WorkflowKind::DevicePackage(package);
        let mut workflow = Workflow::new(kind.to_string(), target);

        if package == Package::AccessDoor {
            let service = &self.settings.door.service_name;
            workflow = workflow.step(WorkflowStep::best_effort(
                format!("Stop {} if running", service),
                StepAction::StopIfRunning {
                    probe: RemoteCommand::plain(format!(
                        "ps -ef | grep {} | grep -v grep || true",
                        service
                    )),
                    stop: RemoteCommand::privileged(format!("systemctl stop {}", service)),
                },
            ));
        }

        workflow = workflow
            .step(WorkflowStep::fatal(
                format!("Upload {}", file_name),
                StepAction::UploadFile {
                    local: path,
                    remote_dir: upload_root.clone(),
                },
            ))
            .step(WorkflowStep::fatal(
                format!("Install {}", file_name),
                StepAction::Command(RemoteCommand::privileged(format!(
                    "cd {} && dpkg -i {}",
                    upload_root,
                    shell_quote(&file_name)
                ))),
            ))
            .step(WorkflowStep::fatal(
                format!("Verify {} version {}", package.dpkg_name(), version),
                StepAction::VerifyVersion {
                    command: RemoteCommand::plain(format!(
                        "dpkg-query -W -f='${{Version}}' {}",
                        package.dpkg_name()
                    )),
                    package: package.dpkg_name().to_string(),
                    expected: version.to_string(),
                },
            ))
            .step(WorkflowStep::best_effort(
                "Remove uploaded package",
                StepAction::Command(RemoteCommand::plain(format!(
                    "rm -f {}",
                    shell_quote(&remote_package)
                ))),
            ));

        Ok(self.with_reboot(workflow))
    }

    fn database_reinstall(&self) -> Result<Workflow, DeployError> {
        let local = self.local(&self.settings.paths.database_folder);
        artifact::require_directory(&local)?;
        let db = &self.settings.database;
        let archive = artifact::find_matching(&local, &db.archive_pattern)?;
        let archive_name = archive
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DeployError::NotFound(archive.display().to_string()))?
            .to_string();
        let has_my_cnf = local.join("my.cnf").is_file();
        let has_init_sql = local.join("init.sql").is_file();

        let target = self.settings.targets.server.to_target();
        let upload = db.upload_root.trim_end_matches('/').to_string();
        let service = &db.service_name;
        let install = &db.install_dir;
        let data = &db.data_dir;
        let sudo = |line: String| StepAction::Command(RemoteCommand::privileged(line));

        let mut workflow = Workflow::new(WorkflowKind::DatabaseReinstall.to_string(), target)
            .step(WorkflowStep::fatal(
                "Upload database bundle",
                StepAction::UploadDirectory {
                    local,
                    remote_root: upload.clone(),
                },
            ))
            .step(WorkflowStep::best_effort(
                format!("Stop {}", service),
                sudo(format!("systemctl stop {}", service)),
            ))
            .step(WorkflowStep::best_effort(
                "Kill leftover database processes",
                sudo(format!("pkill -9 -f {}", service)),
            ))
            .step(WorkflowStep::fatal(
                "Remove previous installation",
                sudo(format!("rm -rf {} {}", install, data)),
            ))
            .step(WorkflowStep::fatal(
                format!("Unpack {}", archive_name),
                sudo(format!(
                    "mkdir -p {install} && tar xf {upload}/{archive} -C {install} --strip-components=1",
                    install = install,
                    upload = upload,
                    archive = shell_quote(&archive_name)
                )),
            ))
            .step(WorkflowStep::best_effort(
                "Create mysql group",
                sudo("groupadd mysql".to_string()),
            ))
            .step(WorkflowStep::best_effort(
                "Create mysql user",
                sudo("useradd -r -g mysql -s /bin/false mysql".to_string()),
            ))
            .step(WorkflowStep::fatal(
                "Create data directory",
                sudo(format!("mkdir -p {}", data)),
            ))
            .step(WorkflowStep::fatal(
                "Set ownership and permissions",
                sudo(format!(
                    "chown -R mysql:mysql {install} {data} && chmod -R 755 {install}",
                    install = install,
                    data = data
                )),
            ));

        if has_my_cnf {
            workflow = workflow.step(WorkflowStep::fatal(
                "Install my.cnf",
                sudo(format!("cp -f {}/my.cnf /etc/my.cnf", upload)),
            ));
        }

        workflow = workflow
            .step(WorkflowStep::fatal(
                "Initialize data directory",
                sudo(format!(
                    "{install}/bin/mysqld --initialize-insecure --user=mysql --basedir={install} --datadir={data}",
                    install = install,
                    data = data
                )),
            ))
            .step(WorkflowStep::fatal(
                "Install service script",
                sudo(format!(
                    "cp -f {install}/support-files/mysql.server /etc/init.d/{service} && chmod +x /etc/init.d/{service} && systemctl daemon-reload",
                    install = install,
                    service = service
                )),
            ))
            .step(WorkflowStep::fatal(
                format!("Start {}", service),
                sudo(format!("systemctl start {}", service)),
            ))
            .step(self.verify_service(service));

        if has_init_sql {
            workflow = workflow.step(WorkflowStep::fatal(
                "Import init.sql",
                sudo(format!("{}/bin/mysql -uroot < {}/init.sql", install, upload)),
            ));
        }

        Ok(workflow.step(WorkflowStep::best_effort(
            "Remove uploaded bundle",
            sudo(format!("rm -rf {}", upload)),
        )))
    }

    fn door_config_patch(&self) -> Result<Workflow, DeployError> {
        let overrides_path = self
            .local(&self.settings.paths.door_folder)
            .join(&self.settings.door.overrides_file);
        let overrides = artifact::parse_overrides(&overrides_path)?;

        let target = self.settings.targets.cabinet.to_target();
        let door = &self.settings.door;
        let config_file = &door.config_file;

        let mut workflow = Workflow::new(WorkflowKind::DoorConfigPatch.to_string(), target).step(
            WorkflowStep::best_effort(
                "Back up door configuration",
                StepAction::Command(RemoteCommand::privileged(format!(
                    "cp -f {file} {file}.bak",
                    file = config_file
                ))),
            ),
        );

        for (key, value) in &overrides {
            workflow = workflow.step(WorkflowStep::fatal(
                format!("Set {}", key),
                StepAction::Command(RemoteCommand::privileged(set_key_command(
                    config_file,
                    key,
                    value,
                ))),
            ));
        }

        workflow = workflow
            .step(WorkflowStep::fatal(
                "Verify door configuration",
                StepAction::VerifyContains {
                    command: RemoteCommand::privileged(format!("cat {}", config_file)),
                    expected_lines: overrides
                        .iter()
                        .map(|(key, value)| format!("{}={}", key, value))
                        .collect(),
                },
            ))
            .step(WorkflowStep::fatal(
                format!("Restart {}", door.service_name),
                StepAction::Command(RemoteCommand::privileged(format!(
                    "systemctl restart {}",
                    door.service_name
                ))),
            ))
            .step(self.verify_service(&door.service_name));

        Ok(self.with_reboot(workflow))
    }

    fn verify_service(&self, service: &str) -> WorkflowStep {
        WorkflowStep::fatal(
            format!("Verify {} is running", service),
            StepAction::VerifyStatus {
                command: RemoteCommand::privileged(format!(
                    "systemctl status {} --no-pager",
                    service
                )),
                expected_token: self.settings.workflow.active_marker.clone(),
                settle: self.settings.workflow.settle_delay(),
            },
        )
    }

    fn with_reboot(&self, workflow: Workflow) -> Workflow {
        let settings = &self.settings.workflow;
        if !settings.reboot_after_device_update {
            return workflow;
        }
        workflow.step(WorkflowStep::best_effort(
            format!("Schedule reboot in {} minute(s)", settings.reboot_delay_minutes),
            StepAction::ScheduleReboot {
                command: RemoteCommand::privileged(format!(
                    "shutdown -r +{}",
                    settings.reboot_delay_minutes
                )),
                fire_window: settings.reboot_fire_window(),
            },
        ))
    }
}

/// Replace `key=...` in `file`, appending the line when the key is absent
fn set_key_command(file: &str, key: &str, value: &str) -> String {
    let pattern = key.replace('.', r"\.");
    let replacement = value.replace('\\', r"\\").replace('|', r"\|").replace('&', r"\&");
    format!(
        "if grep -q '^{pattern}=' {file}; then sed -i 's|^{pattern}=.*|{key}={replacement}|' {file}; else echo '{key}={value}' >> {file}; fi",
        pattern = pattern,
        file = file,
        key = key,
        replacement = replacement,
        value = value
    )
}
