/// Cross-platform directory management for the plugin host
///
/// Uses the `dirs` crate to follow OS conventions:
/// - Linux/Unix: XDG Base Directory Specification
/// - macOS: Apple directory guidelines
/// - Windows: Windows directory standards
use crate::config::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "tcl-plugin-host";

/// Data directory
///
/// - Linux: `$XDG_DATA_HOME/tcl-plugin-host` or `~/.local/share/tcl-plugin-host`
/// - macOS: `~/Library/Application Support/tcl-plugin-host`
/// - Windows: `%LOCALAPPDATA%\tcl-plugin-host`
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::data_local_dir().ok_or(ConfigError::NoDirectory("data"))?;
    Ok(base_dir.join(APP_DIR))
}

/// Config directory
///
/// - Linux: `$XDG_CONFIG_HOME/tcl-plugin-host` or `~/.config/tcl-plugin-host`
/// - macOS: `~/Library/Application Support/tcl-plugin-host`
/// - Windows: `%APPDATA%\tcl-plugin-host`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::config_dir().ok_or(ConfigError::NoDirectory("config"))?;
    Ok(base_dir.join(APP_DIR))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Default host configuration file
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("host.toml"))
}

/// Directory scanned for plugin subdirectories
pub fn plugins_dir() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("plugins"))
}

/// Persisted trust store
pub fn trust_store_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("trust-store.json"))
}

pub fn logs_dir() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("logs"))
}

/// Initialize all required directories
pub fn init_directories() -> Result<(), ConfigError> {
    ensure_dir(&data_dir()?)?;
    ensure_dir(&config_dir()?)?;
    ensure_dir(&plugins_dir()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir() {
        let dir = data_dir().unwrap();
        assert!(dir.to_string_lossy().contains("tcl-plugin-host"));
    }

    #[test]
    fn test_linux_follows_xdg() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let data = data_dir().unwrap();
        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            assert!(data.starts_with(&xdg_data), "{} not under {}", data.display(), xdg_data);
        } else if let Ok(home) = std::env::var("HOME") {
            assert!(data.starts_with(format!("{}/.local/share", home)));
        }
    }

    #[test]
    fn test_subpaths() {
        assert!(plugins_dir().unwrap().ends_with("plugins"));
        assert!(logs_dir().unwrap().ends_with("logs"));
        assert_eq!(trust_store_path().unwrap().file_name().unwrap(), "trust-store.json");
        assert_eq!(config_path().unwrap().file_name().unwrap(), "host.toml");
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }
}
