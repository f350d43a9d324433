//! Central hook registry and dispatcher

use crate::hooks::context::HookContext;
use crate::hooks::errors::HookError;
use crate::hooks::handler::HookHandler;
use crate::hooks::lifecycle::{HookLifecycle, Invocation};
use crate::hooks::result::HookResult;
use crate::hooks::rules::{CompiledRule, RuleLimits, RuleNode};
use crate::hooks::types::{HookPriority, HookStats, HookType};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a handler is registered
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Owning plugin; None for built-ins
    pub plugin_id: Option<String>,

    /// Display name; defaults to the handler's own name
    pub name: Option<String>,

    /// Lower runs earlier
    pub priority: i32,

    /// Disabled registrations stay listed but are skipped on dispatch
    pub enabled: bool,

    /// Exact-match conditions on context data or metadata
    pub conditions: Map<String, Value>,

    /// Condition tree checked after `conditions`; validated on registration
    pub rule: Option<RuleNode>,

    /// Free-form annotations reported back through [`RegistrationInfo`]
    pub metadata: Map<String, Value>,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            plugin_id: None,
            name: None,
            priority: HookPriority::NORMAL,
            enabled: true,
            conditions: Map::new(),
            rule: None,
            metadata: Map::new(),
        }
    }
}

impl RegistrationOptions {
    pub fn for_plugin(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: Some(plugin_id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, key: impl Into<String>, value: Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }

    pub fn with_rule(mut self, rule: RuleNode) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// How a dispatch behaves
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Stop once a handler cancelled the context
    pub stop_on_cancel: bool,

    /// Stop after the first failed handler
    pub stop_on_error: bool,

    /// Plugin raising the event, if any
    pub plugin_id: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            stop_on_cancel: true,
            stop_on_error: false,
            plugin_id: None,
        }
    }
}

impl ExecuteOptions {
    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn stop_on_cancel(mut self, stop: bool) -> Self {
        self.stop_on_cancel = stop;
        self
    }

    pub fn triggered_by(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }
}

struct HookRegistration {
    id: String,
    hook_type: HookType,
    handler: Arc<dyn HookHandler>,
    plugin_id: Option<String>,
    name: String,
    priority: i32,
    sequence: u64,
    enabled: AtomicBool,
    conditions: Map<String, Value>,
    rule: Option<CompiledRule>,
    metadata: Map<String, Value>,
    stats: Mutex<HookStats>,
}

impl HookRegistration {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Empty conditions always match
    fn matches(&self, context: &HookContext) -> bool {
        let conditions_match = self.conditions.iter().all(|(key, expected)| {
            context.get(key).or_else(|| context.get_metadata(key)) == Some(expected)
        });
        conditions_match && self.rule.as_ref().map_or(true, |rule| rule.evaluate(context))
    }

    fn invocation(&self) -> Invocation<'_> {
        Invocation {
            registration_id: &self.id,
            handler: &self.name,
            plugin_id: self.plugin_id.as_deref(),
            hook_type: self.hook_type,
        }
    }

    fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            id: self.id.clone(),
            hook_type: self.hook_type,
            plugin_id: self.plugin_id.clone(),
            name: self.name.clone(),
            priority: self.priority,
            enabled: self.is_enabled(),
            conditions: self.conditions.clone(),
            has_rule: self.rule.is_some(),
            metadata: self.metadata.clone(),
            stats: self.stats.lock().map(|s| s.clone()).unwrap_or_default(),
        }
    }
}

/// Read-only view of a registration
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationInfo {
    pub id: String,
    pub hook_type: HookType,
    /// Owning plugin; None for built-ins
    pub plugin_id: Option<String>,
    pub name: String,
    pub priority: i32,
    /// Current state, including toggles made after registration
    pub enabled: bool,
    pub conditions: Map<String, Value>,
    /// Whether a condition rule is attached
    pub has_rule: bool,
    pub metadata: Map<String, Value>,
    /// Execution counters for this registration alone
    pub stats: HookStats,
}

/// Execution history entry
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHistory {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub hook_type: HookType,
    pub handler: String,
    pub duration: Duration,
    pub success: bool,
}

/// Hook registry and dispatcher
///
/// Cloning is cheap and yields a handle onto the same registry.
#[derive(Clone)]
pub struct HookManager {
    /// Registrations by id
    registrations: Arc<DashMap<String, Arc<HookRegistration>>>,

    /// Per-type lists, sorted by (priority, sequence)
    by_type: Arc<DashMap<HookType, Vec<Arc<HookRegistration>>>>,

    sequence: Arc<AtomicU64>,

    lifecycle: Arc<HookLifecycle>,

    /// Serializes `execute_async` calls
    dispatch_lock: Arc<tokio::sync::Mutex<()>>,

    rule_limits: RuleLimits,

    enabled: Arc<AtomicBool>,

    history: Arc<Mutex<VecDeque<ExecutionHistory>>>,

    max_history: usize,
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(DashMap::new()),
            by_type: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            lifecycle: Arc::new(HookLifecycle::new()),
            dispatch_lock: Arc::new(tokio::sync::Mutex::new(())),
            rule_limits: RuleLimits::default(),
            enabled: Arc::new(AtomicBool::new(true)),
            history: Arc::new(Mutex::new(VecDeque::new())),
            max_history: 1000,
        }
    }

    pub fn with_rule_limits(mut self, limits: RuleLimits) -> Self {
        self.rule_limits = limits;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Register a handler, returning its registration id
    pub fn register<H: HookHandler + 'static>(
        &self,
        hook_type: HookType,
        handler: H,
        options: RegistrationOptions,
    ) -> Result<String, HookError> {
        self.register_shared(hook_type, Arc::new(handler), options)
    }

    pub fn register_shared(
        &self,
        hook_type: HookType,
        handler: Arc<dyn HookHandler>,
        options: RegistrationOptions,
    ) -> Result<String, HookError> {
        let name = options.name.unwrap_or_else(|| handler.name().to_string());

        if let Some(rule) = &options.rule {
            let report = rule.validate(&self.rule_limits);
            if !report.valid {
                return Err(HookError::RegistrationFailed(format!(
                    "Invalid condition rule for '{}': {}",
                    name,
                    report.errors.join("; ")
                )));
            }
            for warning in &report.warnings {
                warn!(handler = %name, "Condition rule: {}", warning);
            }
        }
        let rule = options
            .rule
            .as_ref()
            .map(RuleNode::compile)
            .transpose()
            .map_err(|e| {
                HookError::RegistrationFailed(format!("Invalid condition rule for '{}': {}", name, e))
            })?;

        let registration = Arc::new(HookRegistration {
            id: uuid::Uuid::new_v4().to_string(),
            hook_type,
            handler,
            plugin_id: options.plugin_id,
            name,
            priority: options.priority,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            enabled: AtomicBool::new(options.enabled),
            conditions: options.conditions,
            rule,
            metadata: options.metadata,
            stats: Mutex::new(HookStats::default()),
        });
        let id = registration.id.clone();

        self.registrations.insert(id.clone(), registration.clone());
        {
            let mut list = self.by_type.entry(hook_type).or_default();
            list.push(registration.clone());
            list.sort_by_key(|r| (r.priority, r.sequence));
        }

        debug!(
            hook_type = %hook_type,
            handler = %registration.name,
            plugin_id = registration.plugin_id.as_deref().unwrap_or("builtin"),
            priority = registration.priority,
            "Hook handler registered"
        );
        Ok(id)
    }

    /// Remove one registration
    pub fn unregister(&self, registration_id: &str) -> bool {
        let Some((_, registration)) = self.registrations.remove(registration_id) else {
            return false;
        };
        if let Some(mut list) = self.by_type.get_mut(&registration.hook_type) {
            list.retain(|r| r.id != registration_id);
        }
        debug!(handler = %registration.name, "Hook handler unregistered");
        true
    }

    /// Remove every registration owned by `plugin_id`
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let ids = self.ids_for_plugin(plugin_id);
        let removed = ids.iter().filter(|id| self.unregister(id)).count();
        if removed > 0 {
            info!(plugin_id = %plugin_id, count = removed, "Unregistered plugin hooks");
        }
        removed
    }

    pub fn set_enabled(&self, registration_id: &str, enabled: bool) -> Result<(), HookError> {
        let registration = self
            .registrations
            .get(registration_id)
            .ok_or_else(|| HookError::RegistrationNotFound(registration_id.to_string()))?;
        registration.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Enable or disable all registrations of a plugin, returning how many changed state
    pub fn set_plugin_enabled(&self, plugin_id: &str, enabled: bool) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.plugin_id.as_deref() == Some(plugin_id))
            .filter(|r| r.enabled.swap(enabled, Ordering::SeqCst) != enabled)
            .count()
    }

    pub fn get(&self, registration_id: &str) -> Option<RegistrationInfo> {
        self.registrations.get(registration_id).map(|r| r.info())
    }

    /// Registrations in dispatch order, optionally for one hook type
    pub fn list(&self, hook_type: Option<HookType>) -> Vec<RegistrationInfo> {
        let types: Vec<HookType> = match hook_type {
            Some(t) => vec![t],
            None => HookType::ALL.to_vec(),
        };
        types
            .into_iter()
            .flat_map(|t| self.snapshot(t))
            .map(|r| r.info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn stats(&self, registration_id: &str) -> Option<HookStats> {
        self.registrations
            .get(registration_id)
            .and_then(|r| r.stats.lock().ok().map(|s| s.clone()))
    }

    /// Turn all dispatching on or off
    pub fn set_system_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_system_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> Arc<HookLifecycle> {
        self.lifecycle.clone()
    }

    /// Dispatch with default options
    pub fn dispatch(
        &self,
        hook_type: HookType,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> (HookContext, Vec<HookResult>) {
        self.execute(hook_type, data, metadata, ExecuteOptions::default())
    }

    /// Run every matching handler for `hook_type` in priority order
    ///
    /// Handler errors and panics become failed results; this never fails as a whole.
    pub fn execute(
        &self,
        hook_type: HookType,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        options: ExecuteOptions,
    ) -> (HookContext, Vec<HookResult>) {
        let mut context = HookContext::new(hook_type, data, metadata);
        if let Some(plugin_id) = options.plugin_id {
            context = context.with_plugin_id(plugin_id);
        }

        let mut results = Vec::new();
        if !self.is_system_enabled() {
            return (context, results);
        }

        for registration in self.snapshot(hook_type) {
            let invocation = registration.invocation();
            if !registration.is_enabled() || !registration.matches(&context) {
                self.lifecycle.skipped(invocation);
                continue;
            }

            self.lifecycle.started(invocation);
            let result = self.invoke(&registration, &mut context);

            if result.success {
                self.lifecycle.completed(invocation);
            } else {
                self.lifecycle.failed(invocation, result.error.as_deref().unwrap_or("unknown error"));
            }

            let failed = !result.success;
            context.push_result(result.clone());
            results.push(result);

            if options.stop_on_error && failed {
                debug!(hook_type = %hook_type, handler = %registration.name, "Dispatch stopped on error");
                break;
            }
            if options.stop_on_cancel && context.is_cancelled() {
                debug!(hook_type = %hook_type, handler = %registration.name, "Dispatch cancelled");
                break;
            }
        }

        (context, results)
    }

    /// [`execute`](Self::execute) under a dispatch-wide lock
    ///
    /// Handlers run on the blocking pool; no two async dispatches interleave.
    pub async fn execute_async(
        &self,
        hook_type: HookType,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        options: ExecuteOptions,
    ) -> (HookContext, Vec<HookResult>) {
        let _guard = self.dispatch_lock.lock().await;

        let manager = self.clone();
        let fallback = HookContext::new(hook_type, data.clone(), metadata.clone());
        match tokio::task::spawn_blocking(move || manager.execute(hook_type, data, metadata, options)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(hook_type = %hook_type, "Dispatch task failed: {}", e);
                let mut context = fallback;
                let result = HookResult::failure(format!("dispatch task failed: {}", e));
                context.push_result(result.clone());
                (context, vec![result])
            }
        }
    }

    pub async fn dispatch_async(
        &self,
        hook_type: HookType,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> (HookContext, Vec<HookResult>) {
        self.execute_async(hook_type, data, metadata, ExecuteOptions::default()).await
    }

    /// Most recent executions first
    pub fn get_history(&self, limit: Option<usize>) -> Vec<ExecutionHistory> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    fn invoke(&self, registration: &HookRegistration, context: &mut HookContext) -> HookResult {
        let before = context.modified_data().clone();
        let start = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.handler.call(context)));
        let duration = start.elapsed();

        let mut result = match outcome {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => HookResult::ok(),
            Ok(Err(e)) => HookResult::failure(e.to_string()),
            Err(payload) => HookResult::failure(format!("handler panicked: {}", panic_message(&payload))),
        };

        result.plugin_id = registration.plugin_id.clone();
        result.handler_name = registration.name.clone();
        result.execution_time_ms = duration.as_secs_f64() * 1000.0;
        if result.modified_keys.is_empty() {
            result.modified_keys = changed_keys(&before, context.modified_data());
        }

        if let Ok(mut stats) = registration.stats.lock() {
            if result.success {
                stats.record_success(duration);
            } else {
                stats.record_failure(duration);
            }
        }
        self.record_history(registration, duration, result.success);

        result
    }

    fn snapshot(&self, hook_type: HookType) -> Vec<Arc<HookRegistration>> {
        self.by_type
            .get(&hook_type)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    fn ids_for_plugin(&self, plugin_id: &str) -> Vec<String> {
        self.registrations
            .iter()
            .filter(|r| r.plugin_id.as_deref() == Some(plugin_id))
            .map(|r| r.id.clone())
            .collect()
    }

    fn record_history(&self, registration: &HookRegistration, duration: Duration, success: bool) {
        if self.max_history == 0 {
            return;
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(ExecutionHistory {
                timestamp: chrono::Utc::now(),
                hook_type: registration.hook_type,
                handler: registration.name.clone(),
                duration,
                success,
            });
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("registrations", &self.registrations.len())
            .field("enabled", &self.is_system_enabled())
            .finish()
    }
}

fn changed_keys(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<String> {
    after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
