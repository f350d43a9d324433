//! Dispatch lifecycle events and observers

use crate::hooks::types::HookType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Phase of a single handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPhase {
    Started,
    Completed,
    Failed,
    /// Disabled or conditions did not match
    Skipped,
}

/// Event emitted around each handler invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookLifecycleEvent {
    pub registration_id: String,
    pub handler: String,
    pub plugin_id: Option<String>,
    pub hook_type: HookType,
    pub phase: HookPhase,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub duration: Option<std::time::Duration>,
}

/// Receives lifecycle events
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &HookLifecycleEvent);
}

/// Identifies the invocation an event belongs to
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub registration_id: &'a str,
    pub handler: &'a str,
    pub plugin_id: Option<&'a str>,
    pub hook_type: HookType,
}

/// Fans lifecycle events out to observers and tracks in-flight handlers
pub struct HookLifecycle {
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
    active: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HookLifecycle {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn LifecycleObserver>) -> Result<(), String> {
        self.observers
            .write()
            .map_err(|_| "Failed to acquire write lock")?
            .push(observer);
        Ok(())
    }

    pub fn started(&self, invocation: Invocation<'_>) {
        let event = Self::event(invocation, HookPhase::Started, None, None);
        if let Ok(mut active) = self.active.write() {
            active.insert(invocation.registration_id.to_string(), event.timestamp);
        }
        self.notify(&event);
    }

    pub fn completed(&self, invocation: Invocation<'_>) {
        let duration = self.finish(invocation.registration_id);
        self.notify(&Self::event(invocation, HookPhase::Completed, None, duration));
    }

    pub fn failed(&self, invocation: Invocation<'_>, error: &str) {
        let duration = self.finish(invocation.registration_id);
        self.notify(&Self::event(invocation, HookPhase::Failed, Some(error.to_string()), duration));
    }

    pub fn skipped(&self, invocation: Invocation<'_>) {
        self.notify(&Self::event(invocation, HookPhase::Skipped, None, None));
    }

    /// Registrations currently executing, with their start times
    pub fn active_executions(&self) -> Vec<(String, DateTime<Utc>)> {
        self.active
            .read()
            .map(|active| active.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    fn event(
        invocation: Invocation<'_>,
        phase: HookPhase,
        error: Option<String>,
        duration: Option<std::time::Duration>,
    ) -> HookLifecycleEvent {
        HookLifecycleEvent {
            registration_id: invocation.registration_id.to_string(),
            handler: invocation.handler.to_string(),
            plugin_id: invocation.plugin_id.map(str::to_string),
            hook_type: invocation.hook_type,
            phase,
            timestamp: Utc::now(),
            error,
            duration,
        }
    }

    fn finish(&self, registration_id: &str) -> Option<std::time::Duration> {
        let started = self.active.write().ok()?.remove(registration_id)?;
        Utc::now().signed_duration_since(started).to_std().ok()
    }

    fn notify(&self, event: &HookLifecycleEvent) {
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                observer.on_event(event);
            }
        }
    }
}

impl Default for HookLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer writing lifecycle events to the log
pub struct LoggingObserver {
    log_level: tracing::Level,
}

impl LoggingObserver {
    pub fn new(log_level: tracing::Level) -> Self {
        Self { log_level }
    }
}

impl LifecycleObserver for LoggingObserver {
    fn on_event(&self, event: &HookLifecycleEvent) {
        let message = match (event.phase, &event.error, event.duration) {
            (HookPhase::Started, _, _) => format!("Hook handler '{}' starting", event.handler),
            (HookPhase::Completed, _, Some(duration)) => {
                format!("Hook handler '{}' completed in {:?}", event.handler, duration)
            }
            (HookPhase::Completed, _, None) => format!("Hook handler '{}' completed", event.handler),
            (HookPhase::Failed, Some(error), _) => format!("Hook handler '{}' failed: {}", event.handler, error),
            (HookPhase::Failed, None, _) => format!("Hook handler '{}' failed", event.handler),
            (HookPhase::Skipped, _, _) => format!("Hook handler '{}' skipped", event.handler),
        };
        let plugin = event.plugin_id.as_deref().unwrap_or("builtin");

        match self.log_level {
            tracing::Level::TRACE => tracing::trace!(hook_type = %event.hook_type, plugin_id = plugin, "{}", message),
            tracing::Level::DEBUG => tracing::debug!(hook_type = %event.hook_type, plugin_id = plugin, "{}", message),
            tracing::Level::INFO => tracing::info!(hook_type = %event.hook_type, plugin_id = plugin, "{}", message),
            tracing::Level::WARN => tracing::warn!(hook_type = %event.hook_type, plugin_id = plugin, "{}", message),
            tracing::Level::ERROR => tracing::error!(hook_type = %event.hook_type, plugin_id = plugin, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    struct TestObserver {
        events: Arc<Mutex<Vec<HookLifecycleEvent>>>,
    }

    impl LifecycleObserver for TestObserver {
        fn on_event(&self, event: &HookLifecycleEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }
    }

    fn invocation(id: &str) -> Invocation<'_> {
        Invocation {
            registration_id: id,
            handler: "audit",
            plugin_id: Some("audit-plugin"),
            hook_type: HookType::OnIssueFound,
        }
    }

    #[test]
    fn test_lifecycle_flow() {
        let lifecycle = HookLifecycle::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        lifecycle
            .register_observer(Arc::new(TestObserver { events: events.clone() }))
            .unwrap();

        lifecycle.started(invocation("r1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        lifecycle.completed(invocation("r1"));
        lifecycle.started(invocation("r2"));
        lifecycle.failed(invocation("r2"), "boom");
        lifecycle.skipped(invocation("r3"));

        let events = events.lock().unwrap();
        let phases: Vec<HookPhase> = events.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![HookPhase::Started, HookPhase::Completed, HookPhase::Started, HookPhase::Failed, HookPhase::Skipped]
        );
        assert!(events[1].duration.is_some());
        assert_eq!(events[3].error.as_deref(), Some("boom"));
        assert_eq!(events[0].plugin_id.as_deref(), Some("audit-plugin"));
    }

    #[test]
    fn test_active_executions() {
        let lifecycle = HookLifecycle::new();
        lifecycle.started(invocation("r1"));
        lifecycle.started(invocation("r2"));
        assert_eq!(lifecycle.active_executions().len(), 2);

        lifecycle.completed(invocation("r1"));
        assert_eq!(lifecycle.active_executions().len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_logging_observer() {
        let lifecycle = HookLifecycle::new();
        lifecycle
            .register_observer(Arc::new(LoggingObserver::new(tracing::Level::INFO)))
            .unwrap();

        lifecycle.started(invocation("r1"));
        lifecycle.failed(invocation("r1"), "bad input");

        assert!(logs_contain("Hook handler 'audit' starting"));
        assert!(logs_contain("Hook handler 'audit' failed: bad input"));
    }
}
