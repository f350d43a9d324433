//! Hook execution context

use crate::hooks::result::HookResult;
use crate::hooks::types::HookType;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// State shared by every handler of one dispatch
///
/// The input data never changes during a dispatch; handlers write into an
/// overlay that `get` consults first.
#[derive(Debug, Clone)]
pub struct HookContext {
    hook_type: HookType,
    plugin_id: Option<String>,
    timestamp: DateTime<Utc>,
    data: Map<String, Value>,
    metadata: Map<String, Value>,
    results: Vec<HookResult>,
    cancelled: bool,
    modified: Map<String, Value>,
}

impl HookContext {
    pub fn new(hook_type: HookType, data: Map<String, Value>, metadata: Map<String, Value>) -> Self {
        Self {
            hook_type,
            plugin_id: None,
            timestamp: Utc::now(),
            data,
            metadata,
            results: Vec::new(),
            cancelled: false,
            modified: Map::new(),
        }
    }

    pub fn builder(hook_type: HookType) -> HookContextBuilder {
        HookContextBuilder::new(hook_type)
    }

    pub fn with_plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    /// Plugin that triggered the dispatch, if any
    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Read a value, overlay first
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.modified.get(key).or_else(|| self.data.get(key))
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Write a value into the overlay
    pub fn modify(&mut self, key: impl Into<String>, value: Value) {
        self.modified.insert(key.into(), value);
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Original input
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Values written by handlers so far
    pub fn modified_data(&self) -> &Map<String, Value> {
        &self.modified
    }

    /// Input with the overlay applied
    pub fn merged_data(&self) -> Map<String, Value> {
        let mut merged = self.data.clone();
        for (key, value) in &self.modified {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn results(&self) -> &[HookResult] {
        &self.results
    }

    pub(crate) fn push_result(&mut self, result: HookResult) {
        self.results.push(result);
    }
}

/// Builder for [`HookContext`]
#[derive(Debug)]
pub struct HookContextBuilder {
    hook_type: HookType,
    plugin_id: Option<String>,
    data: Map<String, Value>,
    metadata: Map<String, Value>,
}

impl HookContextBuilder {
    pub fn new(hook_type: HookType) -> Self {
        Self {
            hook_type,
            plugin_id: None,
            data: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn build(self) -> HookContext {
        let context = HookContext::new(self.hook_type, self.data, self.metadata);
        match self.plugin_id {
            Some(plugin_id) => context.with_plugin_id(plugin_id),
            None => context,
        }
    }
}

/// Collect a JSON value into a map; non-objects yield an empty map
pub fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overlay_reads_before_input() {
        let mut context = HookContext::builder(HookType::OnIssueFound)
            .with_data("severity", json!("low"))
            .build();

        assert_eq!(context.get("severity"), Some(&json!("low")));
        context.modify("severity", json!("high"));
        assert_eq!(context.get("severity"), Some(&json!("high")));

        // input untouched
        assert_eq!(context.data().get("severity"), Some(&json!("low")));
        assert_eq!(context.merged_data().get("severity"), Some(&json!("high")));
        assert_eq!(context.get("missing"), None);
    }

    #[test]
    fn test_cancellation() {
        let mut context = HookContext::new(HookType::OnError, Map::new(), Map::new());
        assert!(!context.is_cancelled());
        context.cancel();
        assert!(context.is_cancelled());
    }

    #[test]
    fn test_builder() {
        let context = HookContext::builder(HookType::OnSchemaChange)
            .with_plugin_id("schema-watch")
            .with_metadata("source", json!("warehouse"))
            .build();

        assert_eq!(context.hook_type(), HookType::OnSchemaChange);
        assert_eq!(context.plugin_id(), Some("schema-watch"));
        assert_eq!(context.get_metadata("source"), Some(&json!("warehouse")));
        assert!(context.results().is_empty());
    }

    #[test]
    fn test_into_map() {
        assert_eq!(into_map(json!({"a": 1})).len(), 1);
        assert!(into_map(json!([1, 2])).is_empty());
    }
}
