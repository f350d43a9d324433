//! Metrics collection hook handler

use crate::hooks::context::HookContext;
use crate::hooks::errors::HookError;
use crate::hooks::handler::HookHandler;
use crate::hooks::result::HookResult;
use crate::hooks::types::HookType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Counters for one hook type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HookCounter {
    pub invocations: u64,
    pub cancelled: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Built-in handler counting invocations per hook type
///
/// Clones share the same counters, so one instance can be registered for
/// several hook types and read through another handle.
#[derive(Clone)]
pub struct MetricsHandler {
    name: String,
    counters: Arc<Mutex<HashMap<HookType, HookCounter>>>,
}

impl MetricsHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> HashMap<HookType, HookCounter> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, hook_type: HookType) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(&hook_type).map(|counter| counter.invocations))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.clear();
        }
    }
}

impl HookHandler for MetricsHandler {
    fn call(&self, context: &mut HookContext) -> Result<Option<HookResult>, HookError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| HookError::execution_failed(&self.name, "metrics lock poisoned"))?;
        let counter = counters.entry(context.hook_type()).or_default();
        counter.invocations += 1;
        if context.is_cancelled() {
            counter.cancelled += 1;
        }
        counter.last_seen = Some(Utc::now());
        Ok(None)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_counts_per_hook_type() {
        let metrics = MetricsHandler::new("metrics");
        let handle = metrics.clone();

        for hook_type in [HookType::OnIssueFound, HookType::OnIssueFound, HookType::OnError] {
            let mut context = HookContext::new(hook_type, Map::new(), Map::new());
            metrics.call(&mut context).unwrap();
        }

        assert_eq!(handle.count(HookType::OnIssueFound), 2);
        assert_eq!(handle.count(HookType::OnError), 1);
        assert_eq!(handle.count(HookType::BeforeProfile), 0);

        let snapshot = handle.snapshot();
        assert!(snapshot[&HookType::OnError].last_seen.is_some());

        handle.reset();
        assert!(metrics.snapshot().is_empty());
    }

    #[test]
    fn test_counts_cancelled() {
        let metrics = MetricsHandler::new("metrics");
        let mut context = HookContext::new(HookType::BeforeValidation, Map::new(), Map::new());
        context.cancel();
        metrics.call(&mut context).unwrap();
        assert_eq!(metrics.snapshot()[&HookType::BeforeValidation].cancelled, 1);
    }
}
