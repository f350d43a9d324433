//! `plugin.toml` manifest

use crate::hooks::{HookPriority, HookType, RuleNode};
use crate::plugin::{PluginError, PluginResult};
use crate::sandbox::parser;
use crate::security::PolicySelection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Plugin manifest
///
/// ```toml
/// id = "null-audit"
/// name = "Null audit"
/// version = "0.1.0"
/// source = "audit.tcl"
/// signature = "audit.tcl.sig"
/// policy = "strict"
///
/// [[hooks]]
/// hook_type = "on_issue_found"
/// handler = "on_issue"
/// priority = 50
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,

    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    /// TCL source, relative to the manifest
    pub source: PathBuf,

    /// Detached signature, relative to the manifest
    #[serde(default)]
    pub signature: Option<PathBuf>,

    /// Falls back to the host's default policy
    #[serde(default)]
    pub policy: Option<PolicySelection>,

    #[serde(default)]
    pub hooks: Vec<HookSpec>,

    #[serde(skip)]
    base_dir: PathBuf,
}

/// One handler proc bound to a hook type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub hook_type: HookType,

    /// Proc name in the plugin source
    pub handler: String,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub conditions: Map<String, Value>,

    #[serde(default)]
    pub when: Option<RuleNode>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_priority() -> i32 {
    HookPriority::NORMAL
}

fn default_true() -> bool {
    true
}

impl PluginManifest {
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml(&text, base_dir)
    }

    pub fn from_toml(text: &str, base_dir: impl Into<PathBuf>) -> PluginResult<Self> {
        let mut manifest: Self = toml::from_str(text)?;
        manifest.base_dir = base_dir.into();
        Ok(manifest)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn source_path(&self) -> PathBuf {
        self.base_dir.join(&self.source)
    }

    pub fn signature_path(&self) -> Option<PathBuf> {
        self.signature.as_ref().map(|sig| self.base_dir.join(sig))
    }

    /// Check the manifest against the plugin's TCL source
    pub fn validate(&self, source: &str) -> PluginResult<()> {
        if self.id.trim().is_empty() {
            return Err(PluginError::Manifest("plugin id cannot be empty".to_string()));
        }
        if self.id.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
            return Err(PluginError::Manifest(format!(
                "plugin id '{}' contains whitespace or path separators",
                self.id
            )));
        }
        if self.hooks.is_empty() {
            return Err(PluginError::Manifest(format!("plugin '{}' declares no hooks", self.id)));
        }

        let mut seen = HashSet::new();
        for hook in &self.hooks {
            if !seen.insert((hook.hook_type, hook.handler.as_str())) {
                return Err(PluginError::Manifest(format!(
                    "handler '{}' is bound to {} more than once",
                    hook.handler, hook.hook_type
                )));
            }
        }

        let script = parser::parse(source)
            .map_err(|e| PluginError::Manifest(format!("source has a syntax error at {}", e)))?;
        for hook in &self.hooks {
            if parser::find_proc(&script, &hook.handler).is_none() {
                return Err(PluginError::Manifest(format!(
                    "handler proc '{}' is not defined in {}",
                    hook.handler,
                    self.source.display()
                )));
            }
        }

        Ok(())
    }
}
