//! Hot reload: file watching and per-plugin reload strategies

pub mod manager;
pub mod watcher;

pub use self::manager::{HotReloadManager, ReloadStatus, ReloadStrategy};
pub use self::watcher::{ChangeCallback, ChangeEvent, ChangeKind, FileWatcher, WatcherConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Plugin is not registered for reload: {0}")]
    NotRegistered(String),

    #[error("Reload of '{plugin_id}' failed: {message}")]
    ReloadFailed { plugin_id: String, message: String },

    #[error("Watcher state lock poisoned")]
    LockPoisoned,
}

pub type ReloadResult<T> = Result<T, ReloadError>;
