//! Security policies
//!
//! A policy is a named bundle of capability flags. It decides both whether a
//! plugin may be loaded (signature requirement, minimum trust level) and how
//! its handlers are sandboxed.

use crate::sandbox::config::{ResourceLimits, SandboxConfig};
use crate::security::trust::TrustLevel;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Isolation requested by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    Process,
    Container,
}

/// Capability and trust constraints applied to a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub name: String,

    pub isolation: IsolationLevel,

    pub memory_limit_mb: Option<u64>,

    pub cpu_time_limit_secs: Option<u64>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub network_enabled: bool,

    #[serde(default = "default_true")]
    pub file_read_enabled: bool,

    #[serde(default)]
    pub file_write_enabled: bool,

    #[serde(default)]
    pub require_signature: bool,

    #[serde(default = "default_min_trust")]
    pub min_trust_level: TrustLevel,
}

fn default_timeout_ms() -> u64 {
    ResourceLimits::default().timeout_ms
}

fn default_true() -> bool {
    true
}

fn default_min_trust() -> TrustLevel {
    TrustLevel::Unverified
}

/// Names of the built-in presets
pub const PRESET_NAMES: &[&str] = &["development", "standard", "enterprise", "strict"];

impl SecurityPolicy {
    /// Local development: everything open, nothing signed
    pub fn development() -> Self {
        Self {
            name: "development".to_string(),
            isolation: IsolationLevel::None,
            memory_limit_mb: Some(1024),
            cpu_time_limit_secs: Some(120),
            timeout_ms: 120_000,
            network_enabled: true,
            file_read_enabled: true,
            file_write_enabled: true,
            require_signature: false,
            min_trust_level: TrustLevel::Unverified,
        }
    }

    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            isolation: IsolationLevel::Process,
            memory_limit_mb: Some(256),
            cpu_time_limit_secs: Some(30),
            timeout_ms: 30_000,
            network_enabled: false,
            file_read_enabled: true,
            file_write_enabled: false,
            require_signature: false,
            min_trust_level: TrustLevel::Unverified,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            name: "enterprise".to_string(),
            require_signature: true,
            min_trust_level: TrustLevel::Trusted,
            ..Self::standard()
        }
    }

    pub fn strict() -> Self {
        Self {
            name: "strict".to_string(),
            isolation: IsolationLevel::Container,
            memory_limit_mb: Some(64),
            cpu_time_limit_secs: Some(5),
            timeout_ms: 5_000,
            network_enabled: false,
            file_read_enabled: false,
            file_write_enabled: false,
            require_signature: true,
            min_trust_level: TrustLevel::Trusted,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "development" => Some(Self::development()),
            "standard" => Some(Self::standard()),
            "enterprise" => Some(Self::enterprise()),
            "strict" => Some(Self::strict()),
            _ => None,
        }
    }

    /// Sandbox configuration enforcing this policy
    ///
    /// Isolation `none` still runs the analyzer and restricted interpreter; only
    /// the capability flags are widened.
    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::for_capabilities(
            self.network_enabled,
            self.file_read_enabled,
            self.file_write_enabled,
        );
        config.limits.memory_limit_mb = self.memory_limit_mb;
        config.limits.cpu_time_limit_secs = self.cpu_time_limit_secs;
        config.limits.timeout_ms = self.timeout_ms;
        config
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// A policy reference as written in configuration: a name or an inline bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicySelection {
    Named(String),
    Custom(SecurityPolicy),
}

impl Default for PolicySelection {
    fn default() -> Self {
        Self::Named("standard".to_string())
    }
}

/// Registry of named policies, seeded with the presets
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: DashMap<String, SecurityPolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        let policies = DashMap::new();
        for name in PRESET_NAMES {
            if let Some(policy) = SecurityPolicy::preset(name) {
                policies.insert(name.to_string(), policy);
            }
        }
        Self { policies }
    }

    pub fn get(&self, name: &str) -> Option<SecurityPolicy> {
        self.policies.get(name).map(|p| p.clone())
    }

    /// Administrative update: insert or replace a policy under its own name
    pub fn update(&self, policy: SecurityPolicy) {
        info!(policy = %policy.name, "Security policy updated");
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a selection into a concrete policy
    pub fn resolve(&self, selection: &PolicySelection) -> Option<SecurityPolicy> {
        match selection {
            PolicySelection::Named(name) => self.get(name),
            PolicySelection::Custom(policy) => Some(policy.clone()),
        }
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let dev = SecurityPolicy::development();
        assert_eq!(dev.isolation, IsolationLevel::None);
        assert!(dev.network_enabled && dev.file_write_enabled);
        assert!(!dev.require_signature);

        let standard = SecurityPolicy::standard();
        assert_eq!(standard.isolation, IsolationLevel::Process);
        assert!(!standard.network_enabled && !standard.file_write_enabled);

        let enterprise = SecurityPolicy::enterprise();
        assert!(enterprise.require_signature);
        assert_eq!(enterprise.min_trust_level, TrustLevel::Trusted);

        let strict = SecurityPolicy::strict();
        assert_eq!(strict.isolation, IsolationLevel::Container);
        assert!(!strict.file_read_enabled);
        assert!(strict.require_signature);
        assert!(strict.timeout_ms < standard.timeout_ms);
    }

    #[test]
    fn test_sandbox_config_follows_capabilities() {
        let config = SecurityPolicy::strict().sandbox_config();
        assert!(config.enabled);
        assert_eq!(config.limits.timeout_ms, 5_000);
        assert!(config.check_module("fileutil").is_err());
        assert!(config.check_module("http").is_err());

        let config = SecurityPolicy::development().sandbox_config();
        assert!(config.check_module("http").is_ok());
        assert!(config.check_module("sqlite3").is_ok());
    }

    #[test]
    fn test_registry_update_replaces_preset() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.names().len(), 4);

        let mut custom = SecurityPolicy::standard();
        custom.timeout_ms = 1_000;
        registry.update(custom);

        assert_eq!(registry.get("standard").unwrap().timeout_ms, 1_000);
        // preset constructors are unaffected
        assert_eq!(SecurityPolicy::standard().timeout_ms, 30_000);
    }

    #[test]
    fn test_selection_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            policy: PolicySelection,
        }

        let named: Holder = toml::from_str("policy = \"strict\"").unwrap();
        assert_eq!(named.policy, PolicySelection::Named("strict".to_string()));

        let custom: Holder = toml::from_str(
            r#"
            [policy]
            name = "tight"
            isolation = "process"
            timeout_ms = 250
            require_signature = true
            min_trust_level = "verified"
            "#,
        )
        .unwrap();

        let registry = PolicyRegistry::new();
        let policy = registry.resolve(&custom.policy).unwrap();
        assert_eq!(policy.name, "tight");
        assert_eq!(policy.timeout_ms, 250);
        assert_eq!(policy.min_trust_level, TrustLevel::Verified);
        assert!(policy.file_read_enabled);
        assert!(registry.resolve(&PolicySelection::Named("nope".into())).is_none());
    }
}
