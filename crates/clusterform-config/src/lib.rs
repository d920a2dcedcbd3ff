//! clusterform configuration
//!
//! Settings are resolved once at startup from a YAML file and environment
//! overrides, then passed explicitly to whatever needs them.
//!
//! ```yaml
//! terraform_binary: /usr/local/bin/terraform
//! source_url: github.com/joyent/triton-kubernetes
//! lock_stale_after_secs: 3600
//! backend:
//!   type: remote
//!   url: https://objects.example.com/stor
//!   prefix: clusterform
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming a config file directly
pub const CONFIG_ENV: &str = "CLUSTERFORM_CONFIG";
pub const TERRAFORM_BINARY_ENV: &str = "CLUSTERFORM_TERRAFORM_BINARY";
pub const SOURCE_URL_ENV: &str = "CLUSTERFORM_SOURCE_URL";
pub const STATE_DIR_ENV: &str = "CLUSTERFORM_STATE_DIR";
pub const REMOTE_TOKEN_ENV: &str = "CLUSTERFORM_REMOTE_TOKEN";

const CANDIDATES: [&str; 2] = ["clusterform.yaml", ".clusterform.yaml"];

/// Resolved settings
///
/// Unset optional fields fall back to the defaults of the crate that uses
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// terraform executable (name on PATH or absolute path)
    pub terraform_binary: Option<String>,

    /// Base URL of the terraform module sources
    pub source_url: Option<String>,

    /// Where state documents are stored
    pub backend: BackendSettings,

    /// Age in seconds after which a lock is considered abandoned
    pub lock_stale_after_secs: Option<u64>,

    /// Extra environment passed to terraform
    pub terraform_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSettings {
    Local {
        path: PathBuf,
    },
    Remote {
        url: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Local {
            path: default_state_dir(),
        }
    }
}

/// `~/.config/clusterform`
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("clusterform"))
}

/// Default local state directory (`~/.local/share/clusterform/state` on Linux)
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("clusterform"))
        .unwrap_or_else(|| PathBuf::from(".clusterform"))
        .join("state")
}

/// Find the config file to use, if any
///
/// Search order:
/// 1. `CLUSTERFORM_CONFIG` (must exist when set)
/// 2. current directory: `clusterform.yaml`, `.clusterform.yaml`
/// 3. `~/.config/clusterform/config.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        return Ok(Some(path));
    }

    let current_dir = std::env::current_dir()?;
    for filename in CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Some(config_dir) = get_config_dir() {
        let global_config = config_dir.join("config.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

impl Settings {
    /// Parse a YAML config file
    pub fn from_file(path: &Path) -> Result<Settings> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => e.into(),
        })?;
        Self::from_yaml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    fn from_yaml(content: &str) -> std::result::Result<Settings, String> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Resolve settings: `explicit` file or discovered file, then environment
    pub fn load(explicit: Option<&Path>) -> Result<Settings> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file()?,
        };
        let mut settings = match path {
            Some(path) => Settings::from_file(&path)?,
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Apply `CLUSTERFORM_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Some(binary) = env_value(TERRAFORM_BINARY_ENV) {
            self.terraform_binary = Some(binary);
        }
        if let Some(url) = env_value(SOURCE_URL_ENV) {
            self.source_url = Some(url);
        }
        if let Some(dir) = env_value(STATE_DIR_ENV) {
            self.backend = BackendSettings::Local {
                path: PathBuf::from(dir),
            };
        }
        if let (Some(value), BackendSettings::Remote { token, .. }) =
            (env_value(REMOTE_TOKEN_ENV), &mut self.backend)
        {
            *token = Some(value);
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
