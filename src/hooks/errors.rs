//! Error handling for the hooks system

use crate::sandbox::SandboxError;
use std::time::Duration;
use thiserror::Error;

/// Hook system error types
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook registration not found: {0}")]
    RegistrationNotFound(String),

    #[error("Hook handler '{handler}' execution failed: {message}")]
    ExecutionFailed { handler: String, message: String },

    #[error("Hook handler '{handler}' timed out after {duration:?}")]
    Timeout { handler: String, duration: Duration },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Handler registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}

impl HookError {
    pub fn execution_failed(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn timeout(handler: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            handler: handler.into(),
            duration,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn security_violation(message: impl Into<String>) -> Self {
        Self::SecurityViolation(message.into())
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HookError::RegistrationNotFound("abc".to_string());
        assert_eq!(err.to_string(), "Hook registration not found: abc");

        let err = HookError::timeout("slow_handler", Duration::from_secs(5));
        assert_eq!(err.to_string(), "Hook handler 'slow_handler' timed out after 5s");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let hook_err: HookError = json_err.into();
        assert!(matches!(hook_err, HookError::Serialization(_)));

        let hook_err: HookError = SandboxError::Timeout("Execution timeout".into()).into();
        assert!(hook_err.to_string().contains("Execution timeout"));
    }
}
