//! Shared configuration library for Masterchef.
//!
//! Configuration is layered: a `.env` file is folded into the process
//! environment, a TOML file provides the base values and environment
//! variables override individual keys. The composed [`Config`] passes
//! through guard rails before the server is allowed to start.

pub mod constants;
pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{Config, ConfigMetadata, ServerConfig, StateConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
