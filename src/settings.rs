//! Application settings file.

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use strata_scan::ScanConfig;

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Index database location.
    pub database: Option<PathBuf>,
    /// Scan configuration used by `strata scan`.
    pub scan: Option<ScanConfig>,
}

impl AppConfig {
    /// Default location of the settings file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("strata").join("config.toml"))
    }

    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = fs::read_to_string(&path)
            .wrap_err_with(|| format!("Cannot read config file {}", path.display()))?;
        toml::from_str(&content)
            .wrap_err_with(|| format!("Invalid config file {}", path.display()))
    }

    /// Database path, falling back to the user data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("strata")
                .join("index.db")
        })
    }

    /// Scan configuration, with `roots` replacing the configured ones when given.
    pub fn scan_config(&self, roots: Vec<PathBuf>) -> ScanConfig {
        let mut config = self.scan.clone().unwrap_or_default();
        if !roots.is_empty() {
            config.roots = roots;
        }
        config
    }
}
