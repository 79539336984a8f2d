//! Run configuration

use crate::error::{Error, Result};
use crate::retention::RetentionPolicy;
use crate::types::LaunchMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for one snapshot run
///
/// Every field has a default, so a config file only needs the keys it
/// overrides:
///
/// ```json
/// { "vboxmanage": "/usr/local/bin/VBoxManage", "retention": { "keep": 6 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the VBoxManage executable
    pub vboxmanage: PathBuf,
    /// How to start a powered-off machine before snapshotting
    pub launch_mode: LaunchMode,
    pub retention: RetentionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vboxmanage: PathBuf::from("VBoxManage"),
            launch_mode: LaunchMode::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vboxmanage.as_os_str().is_empty() {
            return Err(Error::Config("vboxmanage path cannot be empty".to_string()));
        }
        Ok(())
    }
}
