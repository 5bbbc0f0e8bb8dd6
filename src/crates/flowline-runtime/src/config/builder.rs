//! Layered configuration loading
//!
//! Configuration is assembled from defaults, an optional file and environment
//! overrides, in that order, and validated once at the end.

use crate::{Result, RuntimeError};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Trait for configuration structures that can be layered and validated
pub trait ConfigBuilder: Default + Clone + DeserializeOwned {
    /// Check value ranges and cross-field constraints
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Apply environment overrides (`{prefix}{FIELD}`) on top of `self`
    fn apply_env(&mut self, prefix: &str) -> Result<()>;

    /// Overlay the fields of `other` that differ from the defaults
    ///
    /// A field of `other` equal to its default is indistinguishable from an
    /// unset one, so it never overrides `self`: an overlay cannot reset a
    /// non-default base value back to the default. [`load`](Self::load)
    /// starts from the defaults, where this makes no difference.
    fn merge(&mut self, other: Self) -> &mut Self;

    /// Defaults plus environment overrides, validated
    fn from_env(prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(prefix)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file, choosing the format from its extension
    ///
    /// Supports `.json`, `.yaml`/`.yml` and `.toml`. Missing fields take
    /// their default values.
    fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .ok_or_else(|| {
                RuntimeError::Configuration(format!(
                    "Unable to determine config format for {:?}",
                    path
                ))
            })?;

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            other => {
                return Err(RuntimeError::Configuration(format!(
                    "Unsupported config file extension: {}",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file (if any), then environment overrides
    fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.merge(Self::from_file(path)?);
        }
        config.apply_env(env_prefix)?;
        config.validate()?;
        Ok(config)
    }
}
