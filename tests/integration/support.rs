//! Shared fakes for the integration tests
//!
//! In-memory collaborators with call counters and failure switches, so the
//! engines can be driven without a network or a platform data directory.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt as _;
use parking_lot::Mutex;
use skein::context::ContextSegment;
use skein::conversation::{Conversation, ConversationPersistenceDriver};
use skein::error::{StorageError, TransportError};
use skein::fs::{
    ChangeEvent, FileContentLoading, FileSystemAccess, FileSystemWatching, LocalFileSystem,
};
use skein::provider::{ChatMessage, CodexClient, StreamEvent, TransportStream};
use skein::types::{ConversationId, FileDescriptor, FileId, FileMetadata};
use skein::workspace::{
    ContextPreferencesState, PreferencesDriver, Selection, WorkspaceCollaborators,
    WorkspacePreferences, WorkspaceSnapshot,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Preference store keyed by workspace root
pub struct MemoryPreferences<T> {
    values: Mutex<HashMap<PathBuf, T>>,
    pub fail_saves: AtomicBool,
    pub saves: AtomicUsize,
    /// Milliseconds each save waits before storing
    pub save_delay_ms: AtomicU64,
}

impl<T> Default for MemoryPreferences<T> {
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
            save_delay_ms: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> MemoryPreferences<T> {
    pub fn stored(&self, root: &Path) -> Option<T> {
        self.values.lock().get(root).cloned()
    }

    pub fn put(&self, root: &Path, value: T) {
        self.values.lock().insert(root.to_path_buf(), value);
    }
}

#[async_trait]
impl<T> PreferencesDriver<T> for MemoryPreferences<T>
where
    T: Clone + Default + Send + Sync,
{
    async fn load(&self, root: &Path) -> Result<T, StorageError> {
        Ok(self.values.lock().get(root).cloned().unwrap_or_default())
    }

    async fn save(&self, value: &T, root: &Path) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "preferences are read-only",
            )));
        }
        self.values.lock().insert(root.to_path_buf(), value.clone());
        Ok(())
    }
}

/// Watcher driven by the test through a channel
#[derive(Default)]
pub struct ChannelWatcher {
    sender: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
}

impl ChannelWatcher {
    pub async fn emit(&self, event: ChangeEvent) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            sender.send(event).await.unwrap();
        }
    }

    /// True once the engine side dropped its receiver
    pub fn sender_closed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map_or(true, |sender| sender.is_closed())
    }

    /// Drop the sender so the engine sees the source end
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

#[async_trait]
impl FileSystemWatching for ChannelWatcher {
    async fn watch(&self, _root: &Path) -> Result<mpsc::Receiver<ChangeEvent>, StorageError> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock() = Some(tx);
        Ok(rx)
    }
}

/// Watcher that can never start
pub struct BrokenWatcher;

#[async_trait]
impl FileSystemWatching for BrokenWatcher {
    async fn watch(&self, root: &Path) -> Result<mpsc::Receiver<ChangeEvent>, StorageError> {
        Err(StorageError::InvalidPath(format!(
            "cannot watch {}",
            root.display()
        )))
    }
}

pub struct WorkspaceFixture {
    pub dir: TempDir,
    pub watcher: Arc<ChannelWatcher>,
    pub preferences: Arc<MemoryPreferences<WorkspacePreferences>>,
    pub context_preferences: Arc<MemoryPreferences<ContextPreferencesState>>,
}

impl WorkspaceFixture {
    /// `src/lib.rs`, `src/main.rs`, `docs/guide.md`, `README.md`
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("docs/guide.md"), "# Guide\n").unwrap();
        std::fs::write(root.join("README.md"), "readme\n").unwrap();
        Self {
            dir,
            watcher: Arc::new(ChannelWatcher::default()),
            preferences: Arc::new(MemoryPreferences::default()),
            context_preferences: Arc::new(MemoryPreferences::default()),
        }
    }

    pub fn root(&self) -> PathBuf {
        dunce::canonicalize(self.dir.path()).unwrap()
    }

    pub fn collaborators(&self) -> WorkspaceCollaborators {
        WorkspaceCollaborators {
            fs: Arc::new(LocalFileSystem::new()),
            watcher: self.watcher.clone(),
            preferences: self.preferences.clone(),
            context_preferences: self.context_preferences.clone(),
        }
    }
}

/// Local filesystem that cancels a token from inside a chosen listing
pub struct CancellingFileSystem {
    inner: LocalFileSystem,
    pub listings: AtomicUsize,
    armed: Mutex<Option<(usize, CancellationToken)>>,
}

impl CancellingFileSystem {
    pub fn new() -> Self {
        Self {
            inner: LocalFileSystem::new(),
            listings: AtomicUsize::new(0),
            armed: Mutex::new(None),
        }
    }

    /// Cancel `token` during the `nth` listing from now (1-based)
    pub fn cancel_on_listing(&self, nth: usize, token: CancellationToken) {
        let target = self.listings.load(Ordering::SeqCst) + nth;
        *self.armed.lock() = Some((target, token));
    }
}

#[async_trait]
impl FileSystemAccess for CancellingFileSystem {
    async fn resolve_root(&self, path: &Path) -> Result<FileId, StorageError> {
        self.inner.resolve_root(path).await
    }

    async fn list_children(&self, id: FileId) -> Result<Vec<FileDescriptor>, StorageError> {
        let call = self.listings.fetch_add(1, Ordering::SeqCst) + 1;
        let token = match self.armed.lock().as_ref() {
            Some((target, token)) if *target == call => Some(token.clone()),
            _ => None,
        };
        let listed = self.inner.list_children(id).await;
        if let Some(token) = token {
            token.cancel();
        }
        listed
    }

    async fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError> {
        self.inner.metadata(id).await
    }
}

/// Content loader over a fixed map, counting every load
#[derive(Default)]
pub struct MemoryLoader {
    files: Mutex<HashMap<PathBuf, String>>,
    pub loads: AtomicUsize,
}

impl MemoryLoader {
    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.lock().insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl FileContentLoading for MemoryLoader {
    async fn load(&self, path: &Path) -> Result<String, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))
    }
}

/// Snapshot of `/w` holding the given files, no selection
pub fn snapshot_of(files: &[(&str, FileId)]) -> WorkspaceSnapshot {
    let root_id = FileId::new();
    let mut root = FileDescriptor::directory(root_id, PathBuf::from("/w"));
    let mut descriptors = Vec::new();
    for (path, id) in files {
        root.children.push(*id);
        descriptors.push(FileDescriptor::file(*id, PathBuf::from(path), 10, None));
    }
    descriptors.push(root);
    WorkspaceSnapshot::build(
        Some(PathBuf::from("/w")),
        Selection::cleared(),
        ContextPreferencesState::default(),
        descriptors,
    )
}

/// Response script for one `stream` call
#[derive(Clone)]
pub enum Reply {
    /// Emit these events, then end
    Events(Vec<Result<StreamEvent, TransportError>>),
    /// Emit these events, yielding to the scheduler before each one
    Paced(Vec<Result<StreamEvent, TransportError>>),
    /// Emit these events, then never finish
    Stall(Vec<Result<StreamEvent, TransportError>>),
    /// Fail to open the stream
    Refuse(TransportError),
}

impl Reply {
    pub fn tokens(tokens: &[&str]) -> Self {
        let mut events: Vec<_> = tokens
            .iter()
            .map(|t| Ok(StreamEvent::Token(t.to_string())))
            .collect();
        events.push(Ok(StreamEvent::Done));
        Reply::Events(events)
    }

    /// Like [`Reply::tokens`], but other tasks run between tokens
    pub fn paced_tokens(tokens: &[&str]) -> Self {
        match Self::tokens(tokens) {
            Reply::Events(events) => Reply::Paced(events),
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub segments: Vec<ContextSegment>,
}

/// Transport that replays scripted replies; falls back to "ok" when the script runs out
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedClient {
    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl CodexClient for ScriptedClient {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        segments: Vec<ContextSegment>,
    ) -> Result<TransportStream, TransportError> {
        self.requests.lock().push(RecordedRequest { messages, segments });
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::tokens(&["ok"]));
        match reply {
            Reply::Events(events) => Ok(Box::pin(stream::iter(events))),
            Reply::Paced(events) => Ok(Box::pin(stream::iter(events).then(|event| async move {
                tokio::task::yield_now().await;
                event
            }))),
            Reply::Stall(events) => {
                Ok(Box::pin(stream::iter(events).chain(stream::pending())))
            }
            Reply::Refuse(e) => Err(e),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}


/// Conversation store with save/delete counters and per-call failures
#[derive(Default)]
pub struct CountingStore {
    records: Mutex<HashMap<ConversationId, Conversation>>,
    pub saves: AtomicUsize,
    pub deletes: AtomicUsize,
    /// 1-based save call numbers that fail
    failing_saves: Mutex<HashSet<usize>>,
}

impl CountingStore {
    pub fn failing_on_save(calls: impl IntoIterator<Item = usize>) -> Self {
        let store = Self::default();
        store.failing_saves.lock().extend(calls);
        store
    }

    pub fn preload(&self, conversation: Conversation) {
        self.records.lock().insert(conversation.id, conversation);
    }

    pub fn stored(&self, id: &ConversationId) -> Option<Conversation> {
        self.records.lock().get(id).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationPersistenceDriver for CountingStore {
    async fn load_all(&self) -> Result<Vec<Conversation>, StorageError> {
        let mut all: Vec<_> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let call = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_saves.lock().contains(&call) {
            return Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("disk full on save #{}", call),
            )));
        }
        self.records
            .lock()
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn delete(&self, conversation: &Conversation) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.records.lock().remove(&conversation.id);
        Ok(())
    }
}

/// Poll `check` until it holds or the timeout elapses
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
