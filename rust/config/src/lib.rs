use async_trait::async_trait;
use figment::providers::{Env, Format, Yaml};
use serde::de::DeserializeOwned;
use sketchdb_error::{ErrorCodes, SketchDbError};
use thiserror::Error;

/// Prefix of every environment variable that can override a config file.
pub const ENV_PREFIX: &str = "SKETCHDB_";

/// Builds a component from its configuration.
///
/// Components that own resources (caches, stores, indexes) implement this so
/// that a single config tree can be turned into a running system.
#[async_trait]
pub trait Configurable<T, E = Box<dyn SketchDbError>> {
    async fn try_from_config(config: &T) -> Result<Self, E>
    where
        Self: Sized;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error loading config: {0}")]
    Extract(#[from] Box<figment::Error>),
}

impl SketchDbError for ConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Loads `T` from the YAML file at `path` (when it exists) merged with
/// environment variables carrying `env_prefix`. Nested keys are separated with
/// a double underscore in the variable name, e.g.
/// `SKETCHDB_INDEX__SKETCH_BITS=32` sets `index.sketch_bits`.
pub fn load_config<T: DeserializeOwned>(path: &str, env_prefix: &str) -> Result<T, ConfigError> {
    // figment cannot tell nesting from underscores that belong to a key name,
    // so nesting is spelled with "__".
    let mut f = figment::Figment::from(
        Env::prefixed(env_prefix).map(|k| k.as_str().replace("__", ".").into()),
    );
    if std::path::Path::new(path).exists() {
        f = figment::Figment::from(Yaml::file(path)).merge(f);
    }
    f.extract().map_err(|e| ConfigError::Extract(Box::new(e)))
}

/// Same as [`load_config`] with the default [`ENV_PREFIX`].
pub fn load_config_from_path<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    load_config(path, ENV_PREFIX)
}
