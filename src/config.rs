// src/config.rs

//! Runtime configuration
//!
//! Every section and field is optional in the TOML file; missing values
//! fall back to the defaults below.
//!
//! ```toml
//! [general]
//! concurrency = 4
//!
//! [solver]
//! type = "stochastic"
//! max_attempts = 5000
//!
//! [system]
//! database_engine = "sqlite"
//! database_path = "/var/lib/kiln"
//! rootfs = "/"
//!
//! [[repositories]]
//! name = "main"
//! type = "http"
//! urls = ["https://mirror.example.org/kiln"]
//! ```

use crate::compiler::default_concurrency;
use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::solver::SolverOptions;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub solver: SolverOptions,
    pub system: SystemConfig,
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Worker count for builds and downloads
    pub concurrency: usize,
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// `sqlite` or `memory`
    pub database_engine: String,
    /// Directory holding the system database
    pub database_path: PathBuf,
    /// Root the installer unpacks into
    pub rootfs: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_engine: "sqlite".to_string(),
            database_path: PathBuf::from("/var/lib/kiln"),
            rootfs: PathBuf::from("/"),
        }
    }
}

impl Config {
    /// Read a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        content.parse()
    }

    /// Repositories ordered by ascending priority, stable for ties
    pub fn repositories_by_priority(&self) -> Vec<Repository> {
        let mut repos = self.repositories.clone();
        repos.sort_by_key(|r| r.priority);
        repos
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::ConfigError(e.to_string()))?;
        if config.general.concurrency == 0 {
            return Err(Error::ConfigError(
                "general.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
