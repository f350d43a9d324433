//! Per-handler dispatch results

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one handler invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub success: bool,

    /// Owning plugin, None for built-in handlers
    pub plugin_id: Option<String>,

    pub handler_name: String,

    pub execution_time_ms: f64,

    pub data: Option<Value>,

    pub error: Option<String>,

    /// The handler declined to act on this event
    pub skipped: bool,

    /// Keys the handler wrote into the context overlay
    pub modified_keys: Vec<String>,
}

impl HookResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }
}
