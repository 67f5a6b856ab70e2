//! `notify`-backed watch source
//!
//! Raw notify events are converted to [`ChangeEvent`]s, coalesced over a
//! debounce window and forwarded in arrival order. The output channel closes
//! when the root disappears or the backend reports an unrecoverable error.

use crate::error::StorageError;
use crate::fs::{ChangeEvent, FileSystemWatching};
use async_trait::async_trait;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Watch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum events per forwarded batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Output channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Entry names (or `*.ext` suffixes) whose events are dropped
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_batch_size() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    64
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "target".to_string(),
        "node_modules".to_string(),
        ".DS_Store".to_string(),
        "*.swp".to_string(),
        "*.tmp".to_string(),
    ]
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_batch_size: default_max_batch_size(),
            channel_capacity: default_channel_capacity(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

/// Coalesces events per path; the latest event for a path wins but keeps the
/// position of the first one.
struct EventBatcher {
    config: WatchConfig,
    pending: Vec<ChangeEvent>,
}

impl EventBatcher {
    fn new(config: WatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
        }
    }

    /// Returns true when the batch is full
    fn add_event(&mut self, event: ChangeEvent) -> bool {
        if self.should_ignore(event.path()) {
            return false;
        }
        match self.pending.iter_mut().find(|e| e.path() == event.path()) {
            Some(existing) => *existing = event,
            None => self.pending.push(event),
        }
        self.pending.len() >= self.config.max_batch_size
    }

    fn take_batch(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.pending)
    }

    fn should_ignore(&self, path: &Path) -> bool {
        self.config.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                return path.to_string_lossy().ends_with(suffix);
            }
            path.components().any(|component| match component {
                Component::Normal(name) => name.to_string_lossy() == pattern.as_str(),
                _ => false,
            })
        })
    }
}

/// Convert a notify event to a change event
fn convert_event(event: Event) -> Option<ChangeEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.first().map(|p| ChangeEvent::Created(p.clone())),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                Some(ChangeEvent::Renamed {
                    from: event.paths[0].clone(),
                    to: event.paths[1].clone(),
                })
            } else {
                event.paths.first().map(|p| ChangeEvent::Modified(p.clone()))
            }
        }
        EventKind::Modify(_) => event.paths.first().map(|p| ChangeEvent::Modified(p.clone())),
        EventKind::Remove(_) => event.paths.first().map(|p| ChangeEvent::Removed(p.clone())),
        _ => None,
    }
}

fn is_fatal(error: &notify::Error) -> bool {
    matches!(
        error.kind,
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound
    )
}

/// Watch source backed by the platform's recommended notify watcher
#[derive(Debug, Clone, Default)]
pub struct NotifyWatcher {
    config: WatchConfig,
}

impl NotifyWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FileSystemWatching for NotifyWatcher {
    async fn watch(&self, root: &Path) -> Result<mpsc::Receiver<ChangeEvent>, StorageError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means the forwarding task exited
            let _ = raw_tx.send(res);
        })
        .map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to create watcher: {}", e),
            ))
        })?;

        watcher.watch(root, RecursiveMode::Recursive).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to watch {}: {}", root.display(), e),
            ))
        })?;
        info!(root = %root.display(), "Watching workspace");

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let config = self.config.clone();
        let root: PathBuf = root.to_path_buf();

        tokio::spawn(async move {
            // Dropping the watcher stops the backend
            let _watcher = watcher;
            forward_events(raw_rx, tx, config, root).await;
        });

        Ok(rx)
    }
}

/// Debounce raw backend events into batches and forward them to `tx`
///
/// Returns when the backend fails, the root disappears, or the consumer drops
/// its receiver. The last case is observed while idle and while debouncing.
async fn forward_events(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    tx: mpsc::Sender<ChangeEvent>,
    config: WatchConfig,
    root: PathBuf,
) {
    let debounce = Duration::from_millis(config.debounce_ms);
    let mut batcher = EventBatcher::new(config);

    'outer: loop {
        let first = tokio::select! {
            biased;
            _ = tx.closed() => break,
            raw = raw_rx.recv() => raw,
        };
        let Some(first) = first else {
            break;
        };
        let mut next = Some(first);
        while let Some(raw) = next.take() {
            match raw {
                Ok(event) => {
                    if let Some(change) = convert_event(event) {
                        if batcher.add_event(change) {
                            break;
                        }
                    }
                }
                Err(e) if is_fatal(&e) => {
                    warn!(error = %e, "Watch backend failed");
                    break 'outer;
                }
                Err(e) => warn!(error = %e, "Watch error"),
            }
            next = tokio::select! {
                biased;
                _ = tx.closed() => break 'outer,
                raw = tokio::time::timeout(debounce, raw_rx.recv()) => raw.ok().flatten(),
            };
        }

        if tokio::fs::metadata(&root).await.is_err() {
            warn!(root = %root.display(), "Watched root disappeared");
            break;
        }

        let batch = batcher.take_batch();
        debug!(event_count = batch.len(), "Forwarding change batch");
        for event in batch {
            if tx.send(event).await.is_err() {
                break 'outer;
            }
        }
    }
    debug!(root = %root.display(), "Watch source closed");
}
