//! Polling file watcher
//!
//! Each cycle walks the watched roots, builds a snapshot of file signatures
//! and diffs it against the previous one. Filesystem notifications, when
//! enabled, only wake the loop early; the snapshot diff decides what changed.

use crate::reload::{ReloadError, ReloadResult};
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignature {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub poll_interval: Duration,

    /// Only files with these extensions are tracked; empty tracks everything
    pub extensions: Vec<String>,

    /// Use OS notifications to wake the poll loop early
    pub fs_events: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            extensions: Vec::new(),
            fs_events: false,
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Watches files and directories for changes
pub struct FileWatcher {
    config: WatcherConfig,
    roots: RwLock<Vec<PathBuf>>,
    snapshot: Mutex<HashMap<PathBuf, FileSignature>>,
    subscribers: RwLock<Vec<(u64, ChangeCallback)>>,
    next_subscriber: AtomicU64,
    wake: Arc<Notify>,
    task: Mutex<Option<RunningTask>>,
}

impl FileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            roots: RwLock::new(Vec::new()),
            snapshot: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Start tracking `path`; files already present do not produce events
    pub fn watch(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let baseline = self.scan_root(&path);
        {
            let Ok(mut roots) = self.roots.write() else { return };
            if roots.contains(&path) {
                return;
            }
            roots.push(path.clone());
        }
        if let Ok(mut snapshot) = self.snapshot.lock() {
            snapshot.extend(baseline);
        }
        debug!(path = %path.display(), "Watching path");
    }

    /// Stop tracking `path` without emitting deletions
    pub fn unwatch(&self, path: &Path) {
        if let Ok(mut roots) = self.roots.write() {
            roots.retain(|root| root != path);
        }
        let remaining = self.roots();
        if let Ok(mut snapshot) = self.snapshot.lock() {
            snapshot.retain(|file, _| remaining.iter().any(|root| file.starts_with(root)));
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Register a callback for every change; the returned id unsubscribes it
    pub fn subscribe(&self, callback: ChangeCallback) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push((id, callback));
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let Ok(mut subscribers) = self.subscribers.write() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Run one snapshot-and-diff cycle, notify subscribers and return the events
    pub fn poll_once(&self) -> Vec<ChangeEvent> {
        let current: HashMap<PathBuf, FileSignature> =
            self.roots().iter().flat_map(|root| self.scan_root(root)).collect();

        let events = {
            let Ok(mut previous) = self.snapshot.lock() else {
                return Vec::new();
            };
            let events = diff(&previous, &current);
            *previous = current;
            events
        };

        if !events.is_empty() {
            debug!(changes = events.len(), "Detected file changes");
            if let Ok(subscribers) = self.subscribers.read() {
                for event in &events {
                    for (_, subscriber) in subscribers.iter() {
                        subscriber(event);
                    }
                }
            }
        }
        events
    }

    /// Spawn the poll loop on the current tokio runtime
    pub fn start(self: &Arc<Self>) -> ReloadResult<()> {
        let mut task = self.task.lock().map_err(|_| ReloadError::LockPoisoned)?;
        if task.is_some() {
            return Err(ReloadError::AlreadyRunning);
        }

        let notifier = if self.config.fs_events {
            match self.fs_notifier() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Filesystem notifications unavailable, polling only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let shutdown = Arc::new(Notify::new());
        let watcher = Arc::clone(self);
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            // keeps OS notifications alive for the lifetime of the loop
            let _notifier = notifier;
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(watcher.config.poll_interval) => {}
                    _ = watcher.wake.notified() => trace!("Woken by filesystem event"),
                }
                watcher.poll_once();
            }
            debug!("File watcher stopped");
        });

        *task = Some(RunningTask { handle, shutdown });
        Ok(())
    }

    /// Stop the poll loop and wait for it to exit
    pub async fn stop(&self) {
        let running = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(running) = running {
            running.shutdown.notify_one();
            if let Err(e) = running.handle.await {
                warn!("File watcher task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    fn fs_notifier(&self) -> notify::Result<RecommendedWatcher> {
        let wake = self.wake.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                wake.notify_one();
            }
        })?;
        for root in self.roots() {
            let mode = if root.is_dir() { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
            if let Err(e) = watcher.watch(&root, mode) {
                warn!(path = %root.display(), "Cannot watch path: {}", e);
            }
        }
        Ok(watcher)
    }

    fn tracks(&self, path: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.config.extensions.iter().any(|wanted| wanted.trim_start_matches('.') == ext))
            .unwrap_or(false)
    }

    fn scan_root(&self, root: &Path) -> Vec<(PathBuf, FileSignature)> {
        WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && self.tracks(entry.path()))
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let signature = FileSignature {
                    len: metadata.len(),
                    modified: metadata.modified().ok(),
                };
                Some((entry.into_path(), signature))
            })
            .collect()
    }
}

fn diff(previous: &HashMap<PathBuf, FileSignature>, current: &HashMap<PathBuf, FileSignature>) -> Vec<ChangeEvent> {
    let now = Utc::now();
    let mut events: Vec<ChangeEvent> = Vec::new();

    for (path, signature) in current {
        let kind = match previous.get(path) {
            None => ChangeKind::Created,
            Some(old) if old != signature => ChangeKind::Modified,
            Some(_) => continue,
        };
        events.push(ChangeEvent { path: path.clone(), kind, timestamp: now });
    }
    for path in previous.keys().filter(|path| !current.contains_key(*path)) {
        events.push(ChangeEvent {
            path: path.clone(),
            kind: ChangeKind::Deleted,
            timestamp: now,
        });
    }

    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}
