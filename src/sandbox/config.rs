//! Sandbox configuration and execution results

use serde::{Deserialize, Serialize};

/// Packages that may always be required, whatever the policy
pub const SAFE_MODULES: &[&str] = &[
    "json",
    "math",
    "math::statistics",
    "textutil",
    "struct::list",
    "struct::set",
    "base64",
    "csv",
    "sha256",
    "md5",
    "uuid",
];

/// Packages exposing processes, threads or interpreter internals
pub const PROCESS_MODULES: &[&str] = &[
    "Tclx",
    "Expect",
    "Thread",
    "Ttrace",
    "twapi",
    "registry",
    "dde",
    "Tk",
    "tbcload",
    "tclcompiler",
    "tclparser",
];

/// Packages exposing network access
pub const NETWORK_MODULES: &[&str] = &["http", "tls", "websocket", "udp", "smtp", "ftp", "ntp", "dns"];

/// Packages reading from the filesystem
pub const FILE_READ_MODULES: &[&str] = &["fileutil", "vfs", "tar", "zipfile::decode"];

/// Packages writing to the filesystem or databases
pub const FILE_WRITE_MODULES: &[&str] = &["zipfile::encode", "sqlite3", "tdbc"];

/// Commands available inside the sandbox
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "set", "unset", "append", "lappend", "lindex", "list", "llength", "lrange", "lsearch",
    "lsort", "lreverse", "lset", "concat", "split", "join", "format", "incr", "expr", "if",
    "while", "for", "foreach", "break", "continue", "return", "proc", "error", "catch",
    "throw", "string", "dict", "array", "assert_eq", "puts", "package", "after",
];

/// Commands the executor relies on to bind inputs
pub(crate) const REQUIRED_COMMANDS: &[&str] = &["set"];

/// Resource limits
///
/// Only `timeout_ms` and `recursion_limit` are enforced; memory and CPU limits
/// are carried as metadata for an outer isolation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes
    pub memory_limit_mb: Option<u64>,

    /// CPU time ceiling in seconds
    pub cpu_time_limit_secs: Option<u64>,

    /// Wall-clock timeout for a single execution
    pub timeout_ms: u64,

    /// Maximum proc nesting depth
    pub recursion_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: Some(256),
            cpu_time_limit_secs: Some(30),
            timeout_ms: 30_000,
            recursion_limit: 200,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for untrusted code
    pub fn minimal() -> Self {
        Self {
            memory_limit_mb: Some(64),
            cpu_time_limit_secs: Some(5),
            timeout_ms: 5_000,
            recursion_limit: 100,
        }
    }

    /// Relaxed limits for development
    pub fn relaxed() -> Self {
        Self {
            memory_limit_mb: Some(1024),
            cpu_time_limit_secs: Some(120),
            timeout_ms: 120_000,
            recursion_limit: 1000,
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// When false, code runs in a full interpreter without analysis or capture
    pub enabled: bool,

    /// Memory, CPU, wall-clock and recursion ceilings for one execution
    pub limits: ResourceLimits,

    /// Network capability the module deny-list was built from
    pub network_enabled: bool,

    /// Modules allowed by `package require`; empty means "anything not blocked"
    pub allowed_modules: Vec<String>,

    /// Always refused, even when also listed as allowed
    pub blocked_modules: Vec<String>,

    /// Byte ceiling for each captured output stream
    pub max_output_size: usize,

    /// Commands kept in the interpreter
    pub allowed_commands: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::for_capabilities(false, false, false)
    }
}

impl SandboxConfig {
    /// Build a configuration whose module deny-list follows the capability flags
    pub fn for_capabilities(network: bool, file_read: bool, file_write: bool) -> Self {
        let mut blocked: Vec<String> = PROCESS_MODULES.iter().map(|m| m.to_string()).collect();
        if !network {
            blocked.extend(NETWORK_MODULES.iter().map(|m| m.to_string()));
        }
        if !file_read {
            blocked.extend(FILE_READ_MODULES.iter().map(|m| m.to_string()));
        }
        if !file_write {
            blocked.extend(FILE_WRITE_MODULES.iter().map(|m| m.to_string()));
        }

        Self {
            enabled: true,
            limits: ResourceLimits::default(),
            network_enabled: network,
            allowed_modules: Vec::new(),
            blocked_modules: blocked,
            max_output_size: 64 * 1024,
            allowed_commands: DEFAULT_ALLOWED_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Configuration for trusted internal code only
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.limits.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    pub fn with_allowed_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Decide whether `package require <module>` is admitted
    pub fn check_module(&self, module: &str) -> Result<(), String> {
        if SAFE_MODULES.contains(&module) {
            return Ok(());
        }

        let blocked = self.blocked_modules.iter().any(|blocked| {
            module == blocked || module.starts_with(&format!("{}::", blocked))
        });
        if blocked {
            return Err(format!("module '{}' is blocked", module));
        }

        if !self.allowed_modules.is_empty() && !self.allowed_modules.iter().any(|m| m == module) {
            return Err(format!("module '{}' is not in the allowed module list", module));
        }

        Ok(())
    }

    /// Whether `command` stays in the restricted interpreter
    pub fn is_command_allowed(&self, command: &str) -> bool {
        REQUIRED_COMMANDS.contains(&command) || self.allowed_commands.iter().any(|c| c == command)
    }
}

/// Result of one sandboxed execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,

    /// Return value of the entry point, if one was called
    pub result: Option<serde_json::Value>,

    pub error: Option<String>,

    pub stdout: String,

    pub stderr: String,

    pub execution_time_ms: f64,

    pub memory_estimate_bytes: Option<u64>,

    pub warnings: Vec<String>,
}

impl SandboxResult {
    pub(crate) fn failure(error: impl Into<String>, execution_time_ms: f64, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            execution_time_ms,
            warnings,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_blocks_network_and_files() {
        let config = SandboxConfig::default();
        assert!(config.enabled);
        assert!(config.check_module("http").is_err());
        assert!(config.check_module("fileutil").is_err());
        assert!(config.check_module("Thread").is_err());
        assert!(config.check_module("json").is_ok());
        assert!(config.check_module("struct::tree").is_ok());
    }

    #[test]
    fn test_capabilities_unblock_modules() {
        let config = SandboxConfig::for_capabilities(true, true, false);
        assert!(config.check_module("http").is_ok());
        assert!(config.check_module("fileutil").is_ok());
        assert!(config.check_module("sqlite3").is_err());
        assert!(config.check_module("Tclx").is_err());
    }

    #[test]
    fn test_blocked_module_prefix() {
        let config = SandboxConfig::default();
        let err = config.check_module("http::util").unwrap_err();
        assert!(err.contains("blocked"));
    }

    #[test]
    fn test_allow_list_restricts_but_safe_list_wins() {
        let config = SandboxConfig::default().with_allowed_modules(["report"]);
        assert!(config.check_module("report").is_ok());
        assert!(config.check_module("logger").is_err());
        assert!(config.check_module("math").is_ok());
    }

    #[test]
    fn test_required_commands_always_allowed() {
        let mut config = SandboxConfig::default();
        config.allowed_commands.clear();
        assert!(config.is_command_allowed("set"));
        assert!(!config.is_command_allowed("proc"));
    }

    #[test]
    fn test_resource_limit_presets() {
        assert!(ResourceLimits::minimal().timeout_ms < ResourceLimits::default().timeout_ms);
        assert!(ResourceLimits::relaxed().timeout_ms > ResourceLimits::default().timeout_ms);
    }
}
