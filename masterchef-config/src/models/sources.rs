use std::path::PathBuf;

use masterchef_core::config::ControlPlaneConfig;
use serde::{Deserialize, Serialize};

use crate::util::{parse_bool_var, parse_number_var};

/// Shape of `masterchef.toml`. Every section is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub state: FileStateConfig,
    #[serde(default)]
    pub control: ControlPlaneConfig,
    /// Humantime string such as `"10s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub state_dir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_backlog: Option<usize>,
    pub event_capacity: Option<usize>,
    pub allow_force_during_stop: Option<bool>,
    pub allow_force_during_freeze: Option<bool>,
    pub shutdown_grace: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var("MASTERCHEF_CONFIG")
                .ok()
                .filter(|raw| !raw.trim().is_empty())
                .map(PathBuf::from),
            server_host: std::env::var("SERVER_HOST").ok(),
            server_port: parse_number_var("SERVER_PORT"),
            state_dir: std::env::var("MASTERCHEF_STATE_DIR")
                .ok()
                .map(PathBuf::from),
            workdir: std::env::var("MASTERCHEF_WORKDIR").ok().map(PathBuf::from),
            workers: parse_number_var("MASTERCHEF_WORKERS"),
            max_backlog: parse_number_var("MASTERCHEF_MAX_BACKLOG"),
            event_capacity: parse_number_var("MASTERCHEF_EVENT_CAPACITY"),
            allow_force_during_stop: parse_bool_var(
                "MASTERCHEF_ALLOW_FORCE_DURING_STOP",
            ),
            allow_force_during_freeze: parse_bool_var(
                "MASTERCHEF_ALLOW_FORCE_DURING_FREEZE",
            ),
            shutdown_grace: std::env::var("MASTERCHEF_SHUTDOWN_GRACE").ok(),
        }
    }
}
