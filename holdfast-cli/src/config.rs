//! Configuration file
//!
//! Optional TOML file with the same settings as the command line. Flags
//! given on the command line take precedence over the file.

use anyhow::{Context, Result};
use holdfast_engine::backend::CommandPaths;
use holdfast_engine::config::{DEFAULT_BACKUP_PROPERTY, DEFAULT_HOLD_TAG, DEFAULT_KEEP_DESTINATION};
use holdfast_engine::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Read when `--config` is not given and the file exists
pub const DEFAULT_CONFIG_PATH: &str = "/etc/holdfast/holdfast.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub backup_pools: Vec<String>,
    pub source_pools: Vec<String>,
    pub destroy: bool,
    pub device: Option<String>,
    pub keep_destination: usize,
    pub backup_property: String,
    pub hold_tag: String,
    pub log: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Write the log file as JSON lines
    pub log_json: bool,
    pub commands: CommandPaths,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            backup_pools: Vec::new(),
            source_pools: Vec::new(),
            destroy: false,
            device: None,
            keep_destination: DEFAULT_KEEP_DESTINATION,
            backup_property: DEFAULT_BACKUP_PROPERTY.to_string(),
            hold_tag: DEFAULT_HOLD_TAG.to_string(),
            log: None,
            log_file: None,
            log_json: false,
            commands: CommandPaths::default(),
        }
    }
}

/// Settings taken from the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backup_pools: Vec<String>,
    pub source_pools: Vec<String>,
    pub destroy: bool,
    pub dry_run: bool,
    pub device: Option<String>,
    pub keep: Option<usize>,
}

impl FileConfig {
    /// Load `path`, or the default file if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Run configuration with command line values applied on top
    pub fn run_config(&self, overrides: &Overrides) -> RunConfig {
        let pick = |flag: &Vec<String>, file: &Vec<String>| {
            if flag.is_empty() {
                file.clone()
            } else {
                flag.clone()
            }
        };
        RunConfig {
            backup_pools: pick(&overrides.backup_pools, &self.backup_pools),
            source_pools: pick(&overrides.source_pools, &self.source_pools),
            destroy: overrides.destroy || self.destroy,
            dry_run: overrides.dry_run,
            device: overrides.device.clone().or_else(|| self.device.clone()),
            keep_destination: overrides.keep.unwrap_or(self.keep_destination),
            backup_property: self.backup_property.clone(),
            hold_tag: self.hold_tag.clone(),
            ..RunConfig::default()
        }
    }
}
