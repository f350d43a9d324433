//! Per-plugin reload bookkeeping on top of [`FileWatcher`]

use crate::plugin::PluginLifecycle;
use crate::reload::watcher::{ChangeEvent, FileWatcher};
use crate::reload::{ReloadError, ReloadResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happens when a watched file of a plugin changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStrategy {
    /// Mark the plugin pending; reload only on request
    Manual,
    /// Reload on every change
    #[default]
    Automatic,
    /// Reload once changes have settled for the grace period
    Graceful,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadStatus {
    pub plugin_id: String,
    pub paths: Vec<PathBuf>,
    pub strategy: ReloadStrategy,
    pub reload_count: u64,
    pub last_error: Option<String>,
    pub last_reload: Option<DateTime<Utc>>,
    /// Set when a change has been seen but not yet reloaded
    pub pending_since: Option<DateTime<Utc>>,
}

pub struct HotReloadManager {
    lifecycle: Arc<dyn PluginLifecycle>,
    watcher: Arc<FileWatcher>,
    entries: DashMap<String, ReloadStatus>,
    grace_period: Duration,
    consumer: Mutex<Option<Consumer>>,
}

/// Event-consuming task and its watcher subscription
struct Consumer {
    handle: JoinHandle<()>,
    subscription: u64,
}

impl HotReloadManager {
    pub fn new(lifecycle: Arc<dyn PluginLifecycle>, watcher: Arc<FileWatcher>) -> Self {
        Self {
            lifecycle,
            watcher,
            entries: DashMap::new(),
            grace_period: Duration::from_millis(500),
            consumer: Mutex::new(None),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn watcher(&self) -> &Arc<FileWatcher> {
        &self.watcher
    }

    pub fn register(&self, plugin_id: impl Into<String>, paths: Vec<PathBuf>, strategy: ReloadStrategy) {
        let plugin_id = plugin_id.into();
        for path in &paths {
            self.watcher.watch(path.clone());
        }
        debug!(plugin_id = %plugin_id, ?strategy, "Plugin registered for hot reload");
        self.entries.insert(
            plugin_id.clone(),
            ReloadStatus {
                plugin_id,
                paths,
                strategy,
                reload_count: 0,
                last_error: None,
                last_reload: None,
                pending_since: None,
            },
        );
    }

    pub fn unregister(&self, plugin_id: &str) -> bool {
        let Some((_, status)) = self.entries.remove(plugin_id) else {
            return false;
        };
        for path in &status.paths {
            let shared = self.entries.iter().any(|e| e.paths.contains(path));
            if !shared {
                self.watcher.unwatch(path);
            }
        }
        true
    }

    pub fn set_strategy(&self, plugin_id: &str, strategy: ReloadStrategy) -> ReloadResult<()> {
        let mut entry = self
            .entries
            .get_mut(plugin_id)
            .ok_or_else(|| ReloadError::NotRegistered(plugin_id.to_string()))?;
        entry.strategy = strategy;
        Ok(())
    }

    pub fn status(&self, plugin_id: &str) -> Option<ReloadStatus> {
        self.entries.get(plugin_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<ReloadStatus> {
        let mut statuses: Vec<ReloadStatus> = self.entries.iter().map(|e| e.clone()).collect();
        statuses.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        statuses
    }

    /// Plugins with changes waiting for a reload
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.pending_since.is_some())
            .map(|e| e.plugin_id.clone())
            .collect();
        pending.sort();
        pending
    }

    fn affected(&self, path: &Path) -> Vec<(String, ReloadStrategy)> {
        self.entries
            .iter()
            .filter(|e| e.paths.iter().any(|watched| path.starts_with(watched)))
            .map(|e| (e.plugin_id.clone(), e.strategy))
            .collect()
    }

    /// Apply each affected plugin's strategy to one change; returns the plugins reloaded
    pub async fn handle_event(&self, event: &ChangeEvent) -> Vec<String> {
        let mut reloaded = Vec::new();
        for (plugin_id, strategy) in self.affected(&event.path) {
            debug!(plugin_id = %plugin_id, path = %event.path.display(), kind = ?event.kind, "Change for plugin");
            match strategy {
                ReloadStrategy::Automatic => {
                    if self.reload(&plugin_id).await.is_ok() {
                        reloaded.push(plugin_id);
                    }
                }
                ReloadStrategy::Manual => {
                    if let Some(mut entry) = self.entries.get_mut(&plugin_id) {
                        entry.pending_since.get_or_insert_with(Utc::now);
                    }
                }
                ReloadStrategy::Graceful => {
                    // each change restarts the grace period
                    if let Some(mut entry) = self.entries.get_mut(&plugin_id) {
                        entry.pending_since = Some(Utc::now());
                    }
                }
            }
        }
        reloaded
    }

    /// Reload graceful plugins whose changes have settled
    pub async fn process_pending(&self) -> Vec<String> {
        let grace = chrono::Duration::from_std(self.grace_period).unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let ripe: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.strategy == ReloadStrategy::Graceful)
            .filter(|e| e.pending_since.map_or(false, |since| since + grace <= now))
            .map(|e| e.plugin_id.clone())
            .collect();

        let mut reloaded = Vec::new();
        for plugin_id in ripe {
            if self.reload(&plugin_id).await.is_ok() {
                reloaded.push(plugin_id);
            }
        }
        reloaded
    }

    /// Reload a registered plugin now, whatever its strategy
    pub async fn reload(&self, plugin_id: &str) -> ReloadResult<()> {
        if !self.entries.contains_key(plugin_id) {
            return Err(ReloadError::NotRegistered(plugin_id.to_string()));
        }

        let outcome = self.lifecycle.reload(plugin_id).await;

        let mut entry = self
            .entries
            .get_mut(plugin_id)
            .ok_or_else(|| ReloadError::NotRegistered(plugin_id.to_string()))?;
        entry.pending_since = None;
        match outcome {
            Ok(()) => {
                entry.reload_count += 1;
                entry.last_reload = Some(Utc::now());
                entry.last_error = None;
                info!(plugin_id = %plugin_id, count = entry.reload_count, "Plugin reloaded");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(plugin_id = %plugin_id, "Plugin reload failed: {}", message);
                entry.last_error = Some(message.clone());
                Err(ReloadError::ReloadFailed {
                    plugin_id: plugin_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Start the watcher and a task applying strategies to its events
    pub fn start(self: &Arc<Self>) -> ReloadResult<()> {
        let mut consumer = self.consumer.lock().map_err(|_| ReloadError::LockPoisoned)?;
        if consumer.is_some() {
            return Err(ReloadError::AlreadyRunning);
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChangeEvent>();
        let subscription = self.watcher.subscribe(Arc::new(move |event: &ChangeEvent| {
            let _ = tx.send(event.clone());
        }));
        if let Err(e) = self.watcher.start() {
            self.watcher.unsubscribe(subscription);
            return Err(e);
        }

        let manager = Arc::clone(self);
        let tick = (self.grace_period / 4).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(tick, rx.recv()).await {
                    Ok(Some(event)) => {
                        manager.handle_event(&event).await;
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
                manager.process_pending().await;
            }
        });
        *consumer = Some(Consumer { handle, subscription });
        Ok(())
    }

    pub async fn stop(&self) {
        self.watcher.stop().await;
        let consumer = self.consumer.lock().ok().and_then(|mut c| c.take());
        if let Some(consumer) = consumer {
            self.watcher.unsubscribe(consumer.subscription);
            consumer.handle.abort();
        }
    }
}
