//! Resolved configuration handed to the server.

pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use masterchef_core::config::ControlPlaneConfig;

/// Where the configuration came from.
#[derive(Debug, Default, Clone)]
pub struct ConfigMetadata {
    /// Config file that was read, if any.
    pub config_path: Option<PathBuf>,
    /// Whether a `.env` file was found and applied.
    pub env_file_loaded: bool,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Filesystem locations used by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    /// Run records and component snapshots live here.
    pub dir: PathBuf,
    /// Job `config_path` values resolve relative to this directory.
    pub workdir: PathBuf,
}

/// Fully composed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub metadata: ConfigMetadata,
    pub server: ServerConfig,
    pub state: StateConfig,
    pub control: ControlPlaneConfig,
    /// Upper bound on how long shutdown waits for in-flight work.
    pub shutdown_grace: Duration,
}
