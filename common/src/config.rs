// Configuration management with layered configuration (file, env)
// Hosts, artifact locations and workflow tunables for the deployment fleet

use crate::models::RemoteTarget;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub targets: TargetsConfig,
    pub paths: PathsConfig,
    pub transport: TransportConfig,
    pub workflow: WorkflowConfig,
    pub database: DatabaseConfig,
    pub door: DoorConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// Backend server hosting Cabinet.service and the database
    pub server: TargetConfig,
    /// Cabinet / embedded device host
    pub cabinet: TargetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Host address, optionally in the legacy `user@host` form
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// Remote directory receiving uploads
    pub upload_root: String,
    /// Remote directory the uploaded content is installed into
    #[serde(default)]
    pub install_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory scanned for versioned `.deb` packages
    pub artifact_dir: PathBuf,
    pub backend_folder: PathBuf,
    pub database_folder: PathBuf,
    pub door_folder: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub connect_timeout_seconds: u64,
    pub io_timeout_seconds: u64,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Reuse one authenticated SSH session per (host, port) for commands
    #[serde(default = "default_reuse_sessions")]
    pub reuse_sessions: bool,
}

fn default_reuse_sessions() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub settle_delay_seconds: u64,
    pub reboot_after_device_update: bool,
    pub reboot_delay_minutes: u32,
    pub reboot_fire_window_seconds: u64,
    pub backend_service: String,
    /// Token `systemctl status` prints for a healthy unit
    pub active_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub service_name: String,
    /// Remote directory receiving the database folder
    pub upload_root: String,
    pub install_dir: String,
    pub data_dir: String,
    /// Regex matched against file names in the database folder
    pub archive_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorConfig {
    /// Remote configuration file patched in place
    pub config_file: String,
    pub service_name: String,
    /// `key=value` overrides file inside the local door folder
    pub overrides_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

impl TargetConfig {
    /// Build the immutable target description, splitting a legacy `user@host`
    pub fn to_target(&self) -> RemoteTarget {
        let (username, host) = match self.host.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => (self.username.clone(), self.host.clone()),
        };
        RemoteTarget::new(host, self.port, username, self.upload_root.clone())
            .with_install_root(self.install_root.clone())
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl WorkflowConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_seconds)
    }

    pub fn reboot_fire_window(&self) -> Duration {
        Duration::from_secs(self.reboot_fire_window_seconds)
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Start with built-in defaults so partial files are accepted
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("DEPLOY")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        for (name, target) in [
            ("server", &self.targets.server),
            ("cabinet", &self.targets.cabinet),
        ] {
            let resolved = target.to_target();
            if resolved.host.trim().is_empty() {
                return Err(format!("Target '{}' host cannot be empty", name));
            }
            if resolved.username.trim().is_empty() {
                return Err(format!("Target '{}' username cannot be empty", name));
            }
            if target.port == 0 {
                return Err(format!("Target '{}' port must be greater than 0", name));
            }
            if target.upload_root.trim().is_empty() {
                return Err(format!("Target '{}' upload_root cannot be empty", name));
            }
        }

        if self.transport.connect_timeout_seconds == 0 {
            return Err("Transport connect_timeout_seconds must be greater than 0".to_string());
        }
        if self.transport.io_timeout_seconds == 0 {
            return Err("Transport io_timeout_seconds must be greater than 0".to_string());
        }

        if self.workflow.backend_service.trim().is_empty() {
            return Err("Workflow backend_service cannot be empty".to_string());
        }
        if self.workflow.active_marker.trim().is_empty() {
            return Err("Workflow active_marker cannot be empty".to_string());
        }

        if regex::Regex::new(&self.database.archive_pattern).is_err() {
            return Err(format!(
                "Database archive_pattern is not a valid regex: {}",
                self.database.archive_pattern
            ));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            targets: TargetsConfig {
                server: TargetConfig {
                    host: "192.168.1.50".to_string(),
                    port: 22,
                    username: "root".to_string(),
                    upload_root: "/opt/hjrich/smart-cabinet/cabinet-server-update".to_string(),
                    install_root: Some("/opt/hjrich/smart-cabinet/cabinet-server".to_string()),
                },
                cabinet: TargetConfig {
                    host: "172.30.35.203".to_string(),
                    port: 2222,
                    username: "qingshan".to_string(),
                    upload_root: "/home/qingshan".to_string(),
                    install_root: None,
                },
            },
            paths: PathsConfig {
                artifact_dir: PathBuf::from("."),
                backend_folder: PathBuf::from("cabinet-server-update"),
                database_folder: PathBuf::from("database"),
                door_folder: PathBuf::from("access-door"),
            },
            transport: TransportConfig {
                connect_timeout_seconds: 10,
                io_timeout_seconds: 300,
                connect_retries: 2,
                retry_delay_ms: 1000,
                reuse_sessions: true,
            },
            workflow: WorkflowConfig {
                settle_delay_seconds: 5,
                reboot_after_device_update: true,
                reboot_delay_minutes: 1,
                reboot_fire_window_seconds: 3,
                backend_service: "Cabinet.service".to_string(),
                active_marker: "active (running)".to_string(),
            },
            database: DatabaseConfig {
                service_name: "mysqld".to_string(),
                upload_root: "/opt/hjrich/smart-cabinet/database-update".to_string(),
                install_dir: "/usr/local/mysql".to_string(),
                data_dir: "/usr/local/mysql/data".to_string(),
                archive_pattern: r"^mysql-.*\.tar(\.(gz|xz))?$".to_string(),
            },
            door: DoorConfig {
                config_file: "/opt/access-door/config/door.conf".to_string(),
                service_name: "access-door".to_string(),
                overrides_file: "door.conf".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json: false,
            },
        }
    }
}
