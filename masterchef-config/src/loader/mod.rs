//! File + environment composition.

pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    constants::{
        DEFAULT_CONFIG_LOCATIONS, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT,
        DEFAULT_SHUTDOWN_GRACE, DEFAULT_STATE_DIR, DEFAULT_WORKDIR,
    },
    models::{
        Config, ConfigMetadata, ServerConfig, StateConfig,
        sources::{EnvConfig, FileConfig},
    },
    util::parse_duration,
    validation::{self, ConfigWarnings},
};
use error::ConfigLoadError;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Directory the default config locations are probed in (defaults to the
    /// current directory).
    pub search_root: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_search_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.search_root = Some(path.into());
        self
    }

    /// Apply `.env`, read the process environment and compose the result.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Compose from an already gathered environment snapshot.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, mut warnings) =
            compose_config(file_config, env, config_path, env_file_loaded)?;

        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            let root = self
                .options
                .search_root
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(|candidate| root.join(candidate))
                .find(|candidate| candidate.exists());
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        debug!(path = %path.display(), ?provenance, "Loaded configuration file");
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No masterchef.toml detected; using defaults and environment variables",
            "Pass --config or set MASTERCHEF_CONFIG to point at a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        state: file_state,
        mut control,
        shutdown_grace: file_grace,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
        port: env
            .server_port
            .or(file_server.port)
            .unwrap_or(DEFAULT_SERVER_PORT),
    };

    let state = StateConfig {
        dir: env
            .state_dir
            .or(file_state.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
        workdir: env
            .workdir
            .or(file_state.workdir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR)),
    };

    if let Some(workers) = env.workers {
        control.queue.workers = workers;
    }
    if let Some(max_backlog) = env.max_backlog {
        control.queue.max_backlog = max_backlog;
    }
    if let Some(capacity) = env.event_capacity {
        control.events.capacity = capacity;
    }
    if let Some(allow) = env.allow_force_during_stop {
        control.admission.allow_force_during_stop = allow;
    }
    if let Some(allow) = env.allow_force_during_freeze {
        control.admission.allow_force_during_freeze = allow;
    }

    let shutdown_grace = match env.shutdown_grace.or(file_grace) {
        Some(raw) => parse_duration(&raw).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                field: "shutdown_grace",
                value: raw.clone(),
                source,
            }
        })?,
        None => DEFAULT_SHUTDOWN_GRACE,
    };

    let config = Config {
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
        server,
        state,
        control,
        shutdown_grace,
    };

    Ok((config, warnings))
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(
            self,
            ConfigPathProvenance::Explicit | ConfigPathProvenance::Env
        )
    }
}
