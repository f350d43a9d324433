//! Sandboxed execution of plugin handler code
//!
//! Handler code is TCL. It is parsed and statically checked by the analyzer
//! before it runs, then executed in a restricted `molt` interpreter.

pub mod analyzer;
pub mod config;
pub mod executor;
pub mod parser;

pub use self::analyzer::{AnalysisReport, CodeAnalyzer};
pub use self::config::{ResourceLimits, SandboxConfig, SandboxResult};
pub use self::executor::SandboxExecutor;

use thiserror::Error;

/// Failure of a sandboxed execution, classified from its [`SandboxResult`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("{0}")]
    SecurityViolation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Runtime(String),
}

impl SandboxError {
    fn classify(message: String) -> Self {
        if message.starts_with("Security violation") {
            Self::SecurityViolation(message)
        } else if message.starts_with("Execution timeout") {
            Self::Timeout(message)
        } else {
            Self::Runtime(message)
        }
    }
}

impl SandboxResult {
    /// Turn the result into the entry point's return value or a typed error
    pub fn into_result(self) -> Result<Option<serde_json::Value>, SandboxError> {
        if self.success {
            Ok(self.result)
        } else {
            Err(SandboxError::classify(
                self.error.unwrap_or_else(|| "unknown sandbox failure".to_string()),
            ))
        }
    }
}
