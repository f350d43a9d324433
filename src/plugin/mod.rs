//! Plugin manifests and the loader that turns them into hook registrations

pub mod loader;
pub mod manifest;

pub use self::loader::{PluginInfo, PluginLoader};
pub use self::manifest::{HookSpec, PluginManifest};

use crate::hooks::HookError;
use crate::security::TrustError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Unknown security policy: {0}")]
    UnknownPolicy(String),

    #[error("Plugin '{plugin_id}' failed static analysis: {}", .issues.join("; "))]
    Analysis { plugin_id: String, issues: Vec<String> },

    #[error("Plugin '{plugin_id}' is {state}")]
    InvalidState { plugin_id: String, state: PluginState },

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Current state of a known plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum PluginState {
    Loaded,
    Disabled,
    Failed(String),
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => write!(f, "loaded"),
            Self::Disabled => write!(f, "disabled"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Operations the host performs on plugins
#[async_trait]
pub trait PluginLifecycle: Send + Sync {
    /// Load the plugin described by `manifest_path`, returning its id
    async fn load(&self, manifest_path: &Path) -> PluginResult<String>;

    async fn unload(&self, plugin_id: &str) -> PluginResult<()>;

    async fn enable(&self, plugin_id: &str) -> PluginResult<()>;

    async fn disable(&self, plugin_id: &str) -> PluginResult<()>;

    /// Unload and load again from the recorded manifest path
    async fn reload(&self, plugin_id: &str) -> PluginResult<()>;

    fn state(&self, plugin_id: &str) -> Option<PluginState>;

    fn list(&self) -> Vec<PluginInfo>;
}
