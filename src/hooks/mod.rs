//! Hooks system
//!
//! Named extension points raised by the host. Plugins and built-ins register
//! handlers against a [`HookType`]; [`HookManager`] runs them in priority
//! order against a shared [`HookContext`].

pub mod context;
pub mod errors;
pub mod handler;
pub mod handlers;
pub mod lifecycle;
pub mod manager;
pub mod result;
pub mod rules;
pub mod types;

// Re-export commonly used types
pub use self::context::{HookContext, HookContextBuilder};
pub use self::errors::HookError;
pub use self::handler::{FnHandler, HookHandler};
pub use self::handlers::{LoggingHandler, MetricsHandler, TclScriptHandler};
pub use self::lifecycle::{HookLifecycle, HookLifecycleEvent, HookPhase, LifecycleObserver, LoggingObserver};
pub use self::manager::{ExecuteOptions, ExecutionHistory, HookManager, RegistrationInfo, RegistrationOptions};
pub use self::result::HookResult;
pub use self::rules::{CompiledRule, RuleLimits, RuleNode, RuleValidation};
pub use self::types::{HookPriority, HookStats, HookType};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        ExecuteOptions, FnHandler, HookContext, HookError, HookHandler, HookManager, HookPriority,
        HookResult, HookType, RegistrationOptions, RuleNode,
    };
}
