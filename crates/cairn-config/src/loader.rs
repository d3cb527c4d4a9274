//! Configuration loader: file plus environment overrides.

use std::env;
use std::path::{Path, PathBuf};

use crate::{CairnConfig, ConfigError};

/// Loads a [`CairnConfig`] from a TOML file, then applies `CAIRN_*`
/// environment overrides for the handful of knobs that vary per host.
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            env_prefix: "CAIRN".to_string(),
        }
    }

    /// Set the config file path (default: built-in defaults only).
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "CAIRN").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load, merge, and validate.
    pub fn load(self) -> Result<CairnConfig, ConfigError> {
        let mut config = match &self.path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => CairnConfig::default(),
        };

        self.apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&self, config: &mut CairnConfig) -> Result<(), ConfigError> {
        if let Some(id) = self.env_var("NODE_ID") {
            config.node.id = id;
        }
        if let Some(role) = self.env_var("NODE_ROLE") {
            config.node.role = role;
        }
        if let Some(url) = self.env_var("JOIN_URL") {
            config.node.join_url = url;
        }
        if let Some(addr) = self.env_var("PUBLIC_ADDR") {
            config.node.public_addr = addr;
        }
        if let Some(port) = self.env_var("PUBLIC_PORT") {
            config.node.public_port = parse(&self.var_name("PUBLIC_PORT"), &port)?;
        }
        if let Some(verbosity) = self.env_var("LOG_VERBOSITY") {
            config.log.verbosity = verbosity;
        }
        Ok(())
    }

    fn var_name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.env_prefix)
    }

    fn env_var(&self, suffix: &str) -> Option<String> {
        env::var(self.var_name(suffix)).ok().filter(|v| !v.is_empty())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        reason: format!("cannot parse {value:?}"),
    })
}
