//! TCL script hook handler
//!
//! Calls one proc of a plugin's TCL source inside the sandbox. The proc's
//! parameters are bound by name from `hook_type`, `data`, `metadata` and
//! `plugin_id`. Its return value is interpreted as follows:
//!
//! - empty or `ok`: implicit success
//! - a JSON object or TCL dict whose keys are all among `modify`, `cancel`,
//!   `data`, `skip` and `error`: applied to the context
//! - anything else: success carrying the value as data

use crate::hooks::context::HookContext;
use crate::hooks::errors::HookError;
use crate::hooks::handler::HookHandler;
use crate::hooks::result::HookResult;
use crate::sandbox::parser;
use crate::sandbox::SandboxExecutor;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Parameters a handler proc may declare
pub const HANDLER_PARAMS: &[&str] = &["hook_type", "data", "metadata", "plugin_id"];

const PROTOCOL_KEYS: &[&str] = &["modify", "cancel", "data", "skip", "error"];

pub struct TclScriptHandler {
    proc_name: String,
    plugin_id: Option<String>,
    source: Arc<str>,
    params: Vec<String>,
    executor: SandboxExecutor,
}

impl TclScriptHandler {
    /// Bind `proc_name` from `source`; fails if the proc is missing or declares unknown parameters
    pub fn new(
        proc_name: impl Into<String>,
        source: Arc<str>,
        executor: SandboxExecutor,
    ) -> Result<Self, HookError> {
        let proc_name = proc_name.into();
        let script = parser::parse(&source)
            .map_err(|e| HookError::invalid_config(format!("Syntax error at {}", e)))?;
        let signature = parser::find_proc(&script, &proc_name).ok_or_else(|| {
            HookError::invalid_config(format!("handler proc '{}' is not defined", proc_name))
        })?;

        let mut params = Vec::new();
        for param in &signature.params {
            if HANDLER_PARAMS.contains(&param.name.as_str()) {
                params.push(param.name.clone());
            } else if param.default.is_none() && !(signature.variadic && param.name == "args") {
                return Err(HookError::invalid_config(format!(
                    "handler proc '{}' has unsupported parameter '{}' (expected one of {})",
                    proc_name,
                    param.name,
                    HANDLER_PARAMS.join(", ")
                )));
            }
        }

        Ok(Self {
            proc_name,
            plugin_id: None,
            source,
            params,
            executor,
        })
    }

    pub fn with_plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    fn entry_args(&self, context: &HookContext) -> Map<String, Value> {
        let mut args = Map::new();
        for name in &self.params {
            let value = match name.as_str() {
                "hook_type" => Value::String(context.hook_type().to_string()),
                "data" => Value::Object(context.merged_data()),
                "metadata" => Value::Object(context.metadata().clone()),
                _ => Value::String(self.plugin_id.clone().unwrap_or_default()),
            };
            args.insert(name.clone(), value);
        }
        args
    }
}

impl HookHandler for TclScriptHandler {
    fn call(&self, context: &mut HookContext) -> Result<Option<HookResult>, HookError> {
        let args = self.entry_args(context);
        let outcome = self
            .executor
            .execute(&self.source, &Map::new(), Some(&self.proc_name), &args);

        if !outcome.stdout.is_empty() {
            debug!(handler = %self.proc_name, stdout = %outcome.stdout.trim_end(), "Handler output");
        }
        for warning in &outcome.warnings {
            debug!(handler = %self.proc_name, "Sandbox warning: {}", warning);
        }

        let value = outcome.into_result()?;
        Ok(apply_return_value(context, value))
    }

    fn name(&self) -> &str {
        &self.proc_name
    }
}

/// Interpret a handler proc's return value
pub(crate) fn apply_return_value(context: &mut HookContext, value: Option<Value>) -> Option<HookResult> {
    let value = match value {
        None => return None,
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "ok" {
                return None;
            }
            match protocol_map(trimmed) {
                Some(map) => return Some(apply_protocol(context, map)),
                None => Value::String(s),
            }
        }
        Some(other) => other,
    };
    Some(HookResult::with_data(value))
}

/// Parse a JSON object or even-length TCL dict made only of protocol keys
fn protocol_map(text: &str) -> Option<Map<String, Value>> {
    let map = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return None,
        Err(_) => tcl_dict(text)?,
    };
    if map.is_empty() || !map.keys().all(|k| PROTOCOL_KEYS.contains(&k.as_str())) {
        return None;
    }
    Some(map)
}

/// Key/value pairs of an even TCL list, in source order
fn tcl_pairs(text: &str) -> Option<Vec<(String, String)>> {
    let items = parser::parse_list(text).ok()?;
    if items.is_empty() || items.len() % 2 != 0 {
        return None;
    }
    Some(
        items
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    )
}

fn tcl_dict(text: &str) -> Option<Map<String, Value>> {
    let pairs = tcl_pairs(text)?;
    Some(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

/// A TCL word as the most specific JSON scalar
fn scalar(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        _ => false,
    }
}

fn apply_protocol(context: &mut HookContext, map: Map<String, Value>) -> HookResult {
    let mut modified_keys = Vec::new();
    match map.get("modify") {
        Some(Value::Object(changes)) => {
            for (key, value) in changes {
                context.modify(key.clone(), value.clone());
                modified_keys.push(key.clone());
            }
        }
        Some(Value::String(text)) => {
            for (key, value) in tcl_pairs(text).unwrap_or_default() {
                context.modify(key.clone(), scalar(&value));
                if !modified_keys.contains(&key) {
                    modified_keys.push(key);
                }
            }
        }
        _ => {}
    }

    if map.get("cancel").map_or(false, truthy) {
        context.cancel();
    }

    let mut result = if let Some(error) = map.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        HookResult::failure(message)
    } else if map.get("skip").map_or(false, truthy) {
        HookResult::skipped()
    } else {
        HookResult::ok()
    };

    result.data = map.get("data").map(|d| match d {
        Value::String(s) => scalar(s),
        other => other.clone(),
    });
    result.modified_keys = modified_keys;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookType;
    use crate::sandbox::SandboxConfig;
    use serde_json::json;

    fn handler(source: &str, proc_name: &str) -> TclScriptHandler {
        TclScriptHandler::new(proc_name, Arc::from(source), SandboxExecutor::new(SandboxConfig::default()))
            .unwrap()
            .with_plugin_id("audit")
    }

    fn context() -> HookContext {
        HookContext::builder(HookType::OnIssueFound)
            .with_data("severity", json!("high"))
            .with_data("rows", json!(12))
            .with_metadata("source", json!("orders"))
            .build()
    }

    #[test]
    fn test_missing_proc_and_bad_params() {
        let executor = SandboxExecutor::default();
        let err = TclScriptHandler::new("nope", Arc::from("proc other {} {}"), executor.clone()).err().unwrap();
        assert!(err.to_string().contains("'nope' is not defined"));

        let err = TclScriptHandler::new("h", Arc::from("proc h {ctx} {}"), executor).err().unwrap();
        assert!(err.to_string().contains("unsupported parameter 'ctx'"));
    }

    #[test]
    fn test_implicit_success() {
        let handler = handler("proc on_issue {data} { return ok }", "on_issue");
        let mut ctx = context();
        assert!(handler.call(&mut ctx).unwrap().is_none());
    }

    #[test]
    fn test_params_bound_by_name() {
        let source = r#"
            proc on_issue {metadata hook_type plugin_id data} {
                return "$plugin_id/$hook_type/[dict get $metadata source]/[dict get $data rows]"
            }
        "#;
        let handler = handler(source, "on_issue");
        let mut ctx = context();
        let result = handler.call(&mut ctx).unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!("audit/on_issue_found/orders/12")));
    }

    #[test]
    fn test_tcl_dict_protocol() {
        let source = r#"
            proc on_issue {data} {
                set sev [dict get $data severity]
                return [list modify [list severity critical escalated 1] cancel 1 data $sev]
            }
        "#;
        let handler = handler(source, "on_issue");
        let mut ctx = context();
        let result = handler.call(&mut ctx).unwrap().unwrap();

        assert!(result.success);
        assert_eq!(result.data, Some(json!("high")));
        assert_eq!(result.modified_keys, vec!["severity", "escalated"]);
        assert_eq!(ctx.get("severity"), Some(&json!("critical")));
        assert_eq!(ctx.get("escalated"), Some(&json!(1)));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_modify_keys_keep_handler_order() {
        let mut ctx = context();
        let result = apply_return_value(&mut ctx, Some(json!("modify {zeta 1 alpha 2 mid x alpha 3}"))).unwrap();
        assert_eq!(result.modified_keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(ctx.get("alpha"), Some(&json!(3)));
        assert_eq!(ctx.get("mid"), Some(&json!("x")));
    }

    #[test]
    fn test_json_protocol_error_and_skip() {
        let mut ctx = context();
        let result = apply_return_value(&mut ctx, Some(json!(r#"{"error": "threshold breached"}"#))).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("threshold breached"));

        let result = apply_return_value(&mut ctx, Some(json!("skip 1"))).unwrap();
        assert!(result.skipped);

        // dicts with other keys are plain data
        let result = apply_return_value(&mut ctx, Some(json!("rows 3 cols 4"))).unwrap();
        assert_eq!(result.data, Some(json!("rows 3 cols 4")));

        let result = apply_return_value(&mut ctx, Some(json!(42))).unwrap();
        assert_eq!(result.data, Some(json!(42)));
    }

    #[test]
    fn test_runtime_error_becomes_hook_error() {
        let handler = handler("proc on_issue {} { error {no threshold configured} }", "on_issue");
        let mut ctx = context();
        let err = handler.call(&mut ctx).unwrap_err();
        assert!(matches!(err, HookError::Sandbox(_)));
        assert!(err.to_string().contains("no threshold configured"));
    }
}
