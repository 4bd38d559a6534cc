// ABOUTME: TOML configuration for directory-sync - store, sync settings, daemon, object classes
// ABOUTME: Resolves the config file from --config, the working directory, or the user config dir

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::schema::{ConfiguredSchema, ObjectClass, ObjectClassInfo};
use crate::sync::{CheckpointState, DaemonConfig, SyncSettings};

pub const CONFIG_FILE_NAME: &str = "directory-sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the sqlite-directory database
    pub path: PathBuf,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_state_path() -> PathBuf {
    CheckpointState::default_path()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            state_path: default_state_path(),
        }
    }
}

/// Contents of `directory-sync.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Search base for every change scan
    pub base_context: String,
    /// Changes last made by these identities are never delivered
    #[serde(default)]
    pub modifiers_names_to_filter_out: Vec<String>,
    pub store: StoreConfig,
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub object_classes: Vec<ObjectClassInfo>,
}

impl SyncConfig {
    /// Parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path first, then `./directory-sync.toml`, then the user
    /// config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(local);
        }
        if let Some(dir) = dirs::config_dir() {
            let candidate = dir.join("directory-sync").join("config.toml");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        bail!(
            "No config file found: pass --config or create ./{}",
            CONFIG_FILE_NAME
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_context.trim().is_empty() {
            bail!("base_context must not be empty");
        }
        if self.object_classes.is_empty() {
            bail!("at least one [[object_classes]] entry is required");
        }
        let mut seen = HashSet::new();
        for info in &self.object_classes {
            if info.name.trim().is_empty() || info.ldap_object_class.trim().is_empty() {
                bail!("object classes need both name and ldap_object_class");
            }
            if info.name.parse::<ObjectClass>().map_or(false, |c| c.is_all()) {
                bail!("object class name {} is reserved", info.name);
            }
            if !seen.insert(info.name.to_ascii_lowercase()) {
                bail!("object class {} is defined more than once", info.name);
            }
        }
        if self.daemon.interval_secs == 0 {
            bail!("daemon.interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            base_context: self.base_context.clone(),
            modifiers_names_to_filter_out: self.modifiers_names_to_filter_out.clone(),
        }
    }

    pub fn schema(&self) -> ConfiguredSchema {
        ConfiguredSchema::new(self.object_classes.clone())
    }

    pub fn daemon_config(&self, object_classes: Vec<ObjectClass>) -> DaemonConfig {
        DaemonConfig {
            sync_interval: Duration::from_secs(self.daemon.interval_secs),
            state_path: self.daemon.state_path.clone(),
            object_classes,
        }
    }
}
