//! Configuration management for gotssh

mod manager;
pub mod serde_utils;

pub use manager::{BackoffConfig, HostKeyPolicy, ManagerConfig, ProxyConfig};

use crate::error::ConfigError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Directory holding `config.toml`: the platform config dir plus `gotssh`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gotssh")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a TOML config. A missing file is [`ConfigError::NotFound`] so callers
/// can fall back to defaults.
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(io_error(path)(e)),
    };
    Ok(toml::from_str(&content)?)
}

/// Load `path`, or the defaults when it does not exist
pub fn load_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        other => other,
    }
}

/// Write a TOML config, creating parent directories as needed
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, content).map_err(io_error(path))
}
