//! Engine configuration
//!
//! [`EngineConfig`] carries every option the runtime recognizes. It can be
//! built in code, read from a JSON/YAML/TOML file, and overridden from the
//! environment:
//!
//! ```rust,ignore
//! use flowline_runtime::config::{ConfigBuilder, EngineConfig, ENV_PREFIX};
//! use std::path::Path;
//!
//! // defaults <- pipeline.yaml <- FLOWLINE_* variables
//! let config = EngineConfig::load(Some(Path::new("pipeline.yaml")), ENV_PREFIX)?;
//! ```

mod builder;
mod env;
mod schema;

pub use builder::ConfigBuilder;
pub use env::{env_bool, env_key, env_parse, env_var};
pub use schema::{EngineConfig, ENV_PREFIX};
