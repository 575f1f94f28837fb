//! Persisted plugin configuration and runtime options.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::bindings::KeyBinding;
use crate::cache::DEFAULT_CAPACITY;
use crate::error::{ChatPgpError, Result};
use crate::model::KeyId;

pub const HOME_ENV: &str = "CHATPGP_HOME";
pub const TIMEOUT_ENV: &str = "CHATPGP_BACKEND_TIMEOUT_SECS";
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "useSystemGPG", default)]
    pub use_system_gpg: bool,
    #[serde(rename = "signKeyID", default)]
    pub sign_key_id: Option<KeyId>,
    #[serde(rename = "keyBinding", default)]
    pub key_binding: Vec<KeyBinding>,
}

/// Where the plugin configuration lives between runs.
pub trait ConfigStore: Send + Sync {
    /// Returns the stored config, or the default when nothing was saved yet.
    fn load(&self) -> Result<PluginConfig>;
    fn save(&self, config: &PluginConfig) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<PluginConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<PluginConfig> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &PluginConfig) -> Result<()> {
        *self.config.lock() = config.clone();
        Ok(())
    }
}

/// JSON file store. Writes go to a temp file in the same directory and are
/// renamed into place.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<PluginConfig> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                ChatPgpError::Config(format!("{}: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PluginConfig::default()),
            Err(err) => Err(ChatPgpError::Io(format!(
                "read {} failed: {err}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, config: &PluginConfig) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|err| ChatPgpError::Io(format!("create dir failed: {err}")))?;
        let mut file = NamedTempFile::new_in(dir)
            .map_err(|err| ChatPgpError::Io(format!("temp file error: {err}")))?;
        serde_json::to_writer_pretty(&mut file, config)?;
        file.write_all(b"\n")
            .map_err(|err| ChatPgpError::Io(format!("temp write error: {err}")))?;
        file.persist(&self.path)
            .map_err(|err| ChatPgpError::Io(format!("persist config failed: {err}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainOptions {
    pub backend_timeout: Duration,
    pub cache_capacity: usize,
}

impl Default for KeychainOptions {
    fn default() -> Self {
        Self {
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl KeychainOptions {
    /// Defaults with `CHATPGP_BACKEND_TIMEOUT_SECS` applied.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`KeychainOptions::from_env`], reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(value) = var(TIMEOUT_ENV) {
            let secs = value.parse::<u64>().map_err(|err| {
                ChatPgpError::Config(format!("invalid {TIMEOUT_ENV} value {value:?}: {err}"))
            })?;
            if secs == 0 {
                return Err(ChatPgpError::Config(format!("{TIMEOUT_ENV} must be positive")));
            }
            options.backend_timeout = Duration::from_secs(secs);
        }
        Ok(options)
    }
}

/// Data directory: `CHATPGP_HOME`, else the platform data dir, else `.chatpgp`.
pub fn resolve_home() -> PathBuf {
    resolve_home_with(|key| std::env::var(key).ok())
}

fn resolve_home_with(var: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(value) = var(HOME_ENV) {
        return PathBuf::from(value);
    }
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("chatpgp");
    }
    PathBuf::from(".chatpgp")
}

pub fn keychain_dir(home: &Path) -> PathBuf {
    home.join("keychain")
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.json")
}
