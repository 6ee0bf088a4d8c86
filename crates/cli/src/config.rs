//! Run configuration loaded from a TOML file.
//!
//! ```toml
//! [driver]
//! run_timeout_secs = 120
//! max_depth = 32
//! branch_concurrency = 4
//! isolate_branches = true
//!
//! [chain]
//! signing_group_formation_timeout_secs = 10800
//!
//! [log]
//! filter = "statewalk_engine=info"
//! ```
//!
//! Every table and every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use statewalk_deposit::ChainConfig;
use statewalk_engine::DriverConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub driver: DriverSection,
    pub chain: ChainConfig,
    pub log: LogSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverSection {
    pub run_timeout_secs: u64,
    pub max_depth: usize,
    pub branch_concurrency: usize,
    pub isolate_branches: bool,
}

impl Default for DriverSection {
    fn default() -> Self {
        let defaults = DriverConfig::default();
        Self {
            run_timeout_secs: defaults.run_timeout.as_secs(),
            max_depth: defaults.max_depth,
            branch_concurrency: defaults.branch_concurrency,
            isolate_branches: defaults.isolate_branches,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

impl Config {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.driver.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "driver.run_timeout_secs must be positive".to_string(),
            ));
        }
        if self.driver.branch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "driver.branch_concurrency must be positive".to_string(),
            ));
        }
        if self.chain.lot_sizes.is_empty() {
            return Err(ConfigError::Invalid(
                "chain.lot_sizes must list at least one lot size".to_string(),
            ));
        }
        Ok(())
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            run_timeout: Duration::from_secs(self.driver.run_timeout_secs),
            max_depth: self.driver.max_depth,
            branch_concurrency: self.driver.branch_concurrency,
            isolate_branches: self.driver.isolate_branches,
        }
    }
}
