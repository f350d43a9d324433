//! Host configuration
//!
//! ```toml
//! [system]
//! hooks_enabled = true
//! default_policy = "standard"
//!
//! [sandbox]
//! timeout_ms = 10000
//!
//! [watcher]
//! poll_interval_ms = 500
//! extensions = ["tcl", "toml", "sig"]
//!
//! [logging]
//! level = "debug"
//!
//! [policies.ci]
//! isolation = "process"
//! require_signature = true
//! min_trust_level = "verified"
//! ```

use crate::logging::LoggingConfig;
use crate::platform_dirs;
use crate::reload::{ReloadStrategy, WatcherConfig};
use crate::sandbox::{ResourceLimits, SandboxConfig};
use crate::security::{PolicyRegistry, SecurityPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unable to determine {0} directory")]
    NoDirectory(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Custom policies by name; the table key becomes the policy name
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_true")]
    pub hooks_enabled: bool,

    /// Defaults to the platform data directory
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,

    #[serde(default)]
    pub trust_store: Option<PathBuf>,

    /// Policy for plugins whose manifest names none
    #[serde(default = "default_policy")]
    pub default_policy: String,

    #[serde(default = "default_max_history")]
    pub max_history: usize,

    #[serde(default)]
    pub reload_strategy: ReloadStrategy,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hooks_enabled: true,
            plugins_dir: None,
            trust_store: None,
            default_policy: default_policy(),
            max_history: default_max_history(),
            reload_strategy: ReloadStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Timeout for ad-hoc script runs; plugins use their policy's timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_output")]
    pub max_output_size: usize,

    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_output_size: default_max_output(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

impl SandboxSettings {
    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::default()
            .with_timeout_ms(self.timeout_ms)
            .with_max_output_size(self.max_output_size);
        config.limits.recursion_limit = self.recursion_limit;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub fs_events: bool,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Quiet period for the graceful reload strategy
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            fs_events: false,
            extensions: default_extensions(),
            grace_period_ms: default_grace_period(),
        }
    }
}

impl WatcherSettings {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            extensions: self.extensions.clone(),
            fs_events: self.fs_events,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// A `[policies.<name>]` table; every field falls back to the standard preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub isolation: Option<crate::security::IsolationLevel>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_time_limit_secs: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub network_enabled: Option<bool>,
    #[serde(default)]
    pub file_read_enabled: Option<bool>,
    #[serde(default)]
    pub file_write_enabled: Option<bool>,
    #[serde(default)]
    pub require_signature: Option<bool>,
    #[serde(default)]
    pub min_trust_level: Option<crate::security::TrustLevel>,
}

impl PolicyTable {
    pub fn to_policy(&self, name: &str) -> SecurityPolicy {
        let base = SecurityPolicy::standard();
        SecurityPolicy {
            name: name.to_string(),
            isolation: self.isolation.unwrap_or(base.isolation),
            memory_limit_mb: self.memory_limit_mb.or(base.memory_limit_mb),
            cpu_time_limit_secs: self.cpu_time_limit_secs.or(base.cpu_time_limit_secs),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            network_enabled: self.network_enabled.unwrap_or(base.network_enabled),
            file_read_enabled: self.file_read_enabled.unwrap_or(base.file_read_enabled),
            file_write_enabled: self.file_write_enabled.unwrap_or(base.file_write_enabled),
            require_signature: self.require_signature.unwrap_or(base.require_signature),
            min_trust_level: self.min_trust_level.unwrap_or(base.min_trust_level),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_policy() -> String {
    "standard".to_string()
}

fn default_max_history() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    ResourceLimits::default().timeout_ms
}

fn default_max_output() -> usize {
    64 * 1024
}

fn default_recursion_limit() -> usize {
    ResourceLimits::default().recursion_limit
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_extensions() -> Vec<String> {
    vec!["tcl".to_string(), "toml".to_string(), "sig".to_string()]
}

fn default_grace_period() -> u64 {
    500
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            platform_dirs::ensure_dir(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let known = SecurityPolicy::preset(&self.system.default_policy).is_some()
            || self.policies.contains_key(&self.system.default_policy);
        if !known {
            return Err(ConfigError::Invalid(format!(
                "default policy '{}' is neither a preset nor a [policies] entry",
                self.system.default_policy
            )));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.timeout_ms must be positive".to_string()));
        }
        if self.sandbox.max_output_size == 0 {
            return Err(ConfigError::Invalid("sandbox.max_output_size must be positive".to_string()));
        }
        if self.sandbox.recursion_limit == 0 {
            return Err(ConfigError::Invalid("sandbox.recursion_limit must be positive".to_string()));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("watcher.poll_interval_ms must be positive".to_string()));
        }
        for (name, policy) in &self.policies {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("policy names cannot be empty".to_string()));
            }
            if policy.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!("policy '{}' has a zero timeout", name)));
            }
        }
        self.logging.validate()?;
        Ok(())
    }

    /// Presets plus the configured custom policies
    pub fn policy_registry(&self) -> PolicyRegistry {
        let registry = PolicyRegistry::new();
        for (name, table) in &self.policies {
            registry.update(table.to_policy(name));
        }
        registry
    }

    pub fn plugins_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.system.plugins_dir {
            Some(dir) => Ok(dir.clone()),
            None => platform_dirs::plugins_dir(),
        }
    }

    pub fn trust_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.system.trust_store {
            Some(path) => Ok(path.clone()),
            None => platform_dirs::trust_store_path(),
        }
    }
}
