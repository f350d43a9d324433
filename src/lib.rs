//! Plugin extensibility and trust core
//!
//! - [`hooks`]: priority-ordered hook registry and dispatcher
//! - [`sandbox`]: static analysis and restricted execution of TCL handler code
//! - [`security`]: policies, signing and the signer trust store
//! - [`plugin`]: manifests and the loader wiring the above together
//! - [`reload`]: file watching and hot reload

pub mod config;
pub mod hooks;
pub mod logging;
pub mod platform_dirs;
pub mod plugin;
pub mod reload;
pub mod sandbox;
pub mod security;

pub use config::{ConfigError, HostConfig};
pub use hooks::{HookContext, HookError, HookHandler, HookManager, HookResult, HookType};
pub use plugin::{PluginError, PluginLifecycle, PluginLoader, PluginManifest, PluginState};
pub use sandbox::{CodeAnalyzer, SandboxConfig, SandboxExecutor, SandboxResult};
pub use security::{PolicyRegistry, SecurityPolicy, TrustError, TrustStore};
