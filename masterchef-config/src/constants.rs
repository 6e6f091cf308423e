//! Defaults applied when neither the config file nor the environment sets a value.

use std::time::Duration;

/// Bind address used when nothing else is configured.
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
/// Listen port used when nothing else is configured.
pub const DEFAULT_SERVER_PORT: u16 = 8080;
/// Directory holding run records and JSON snapshots.
pub const DEFAULT_STATE_DIR: &str = ".masterchef";
/// Directory config paths are resolved against.
pub const DEFAULT_WORKDIR: &str = ".";
/// How long shutdown waits for workers before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Config file candidates probed when no explicit path is given.
pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["masterchef.toml", "config/masterchef.toml"];

/// Smallest event log the guard rails accept.
pub const MIN_EVENT_CAPACITY: usize = 16;
/// Worker counts above this only earn a warning.
pub const WORKER_WARNING_THRESHOLD: usize = 64;
