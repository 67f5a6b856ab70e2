//! Workspace State Owner
//!
//! The single serialization point for workspace state. Holds the snapshot, the
//! lookup indices, the active watch loop handle and the update subscribers
//! behind one lock. Every mutation replaces the whole state and publishes to
//! subscribers before the lock is released, so publication order is mutation
//! order. The lock is never held across an `.await`.

use crate::tree::projection::TreeProjection;
use crate::workspace::snapshot::{DescriptorIndex, PathIndex, WorkspaceSnapshot};
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Notice attached to an update that is not a plain mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateNotice {
    /// A watch-triggered refresh failed; the snapshot is the last good one
    RefreshFailed(String),
    /// The watch source ended; no further watch-driven updates will arrive
    WatcherUnavailable,
}

/// One entry of the update stream
#[derive(Debug, Clone)]
pub struct WorkspaceUpdate {
    pub snapshot: Arc<WorkspaceSnapshot>,
    pub projection: Arc<TreeProjection>,
    pub notice: Option<UpdateNotice>,
}

/// Snapshot plus indices, swapped as one value
#[derive(Debug, Clone)]
pub struct OwnedState {
    pub snapshot: Arc<WorkspaceSnapshot>,
    pub projection: Arc<TreeProjection>,
    pub descriptors: Arc<DescriptorIndex>,
    pub paths: Arc<PathIndex>,
}

impl OwnedState {
    pub fn new(snapshot: WorkspaceSnapshot, descriptors: DescriptorIndex, paths: PathIndex) -> Self {
        Self::from_parts(snapshot, Arc::new(descriptors), Arc::new(paths))
    }

    /// New snapshot over existing indices
    pub fn from_parts(
        snapshot: WorkspaceSnapshot,
        descriptors: Arc<DescriptorIndex>,
        paths: Arc<PathIndex>,
    ) -> Self {
        let projection = Arc::new(TreeProjection::from_snapshot(&snapshot));
        Self {
            snapshot: Arc::new(snapshot),
            projection,
            descriptors,
            paths,
        }
    }

    pub fn empty() -> Self {
        Self::new(
            WorkspaceSnapshot::empty(),
            DescriptorIndex::new(),
            PathIndex::new(),
        )
    }

    fn update(&self, notice: Option<UpdateNotice>) -> WorkspaceUpdate {
        WorkspaceUpdate {
            snapshot: Arc::clone(&self.snapshot),
            projection: Arc::clone(&self.projection),
            notice,
        }
    }
}

/// Handle to a running watch loop
#[derive(Debug)]
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    fn stop(self) {
        self.cancel.cancel();
        debug!(finished = self.task.is_finished(), "Stopped watch loop");
    }
}

/// Ordered stream of workspace updates; dropping it unsubscribes
#[derive(Debug)]
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<WorkspaceUpdate>,
}

impl UpdateStream {
    pub async fn recv(&mut self) -> Option<WorkspaceUpdate> {
        self.rx.recv().await
    }

    /// Next update if one is already queued
    pub fn try_recv(&mut self) -> Option<WorkspaceUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Stream for UpdateStream {
    type Item = WorkspaceUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Owned {
    state: OwnedState,
    watcher: Option<WatcherHandle>,
    subscribers: Vec<mpsc::UnboundedSender<WorkspaceUpdate>>,
    closed: bool,
}

impl Owned {
    fn publish(&mut self, notice: Option<UpdateNotice>) {
        if self.subscribers.is_empty() {
            return;
        }
        let update = self.state.update(notice);
        self.subscribers
            .retain(|subscriber| subscriber.send(update.clone()).is_ok());
    }
}

pub struct WorkspaceStateOwner {
    owned: Mutex<Owned>,
}

impl WorkspaceStateOwner {
    pub fn new() -> Self {
        Self {
            owned: Mutex::new(Owned {
                state: OwnedState::empty(),
                watcher: None,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Replace the whole state and publish it
    pub fn replace(&self, state: OwnedState) -> Arc<WorkspaceSnapshot> {
        let mut owned = self.owned.lock();
        owned.state = state;
        owned.publish(None);
        Arc::clone(&owned.state.snapshot)
    }

    /// Atomic read-modify-write
    ///
    /// `f` sees the latest state. On `Ok` its state replaces the current one
    /// and is published; on `Err` nothing changes.
    pub fn update<R, E, F>(&self, f: F) -> Result<(Arc<WorkspaceSnapshot>, R), E>
    where
        F: FnOnce(&OwnedState) -> Result<(OwnedState, R), E>,
    {
        let mut owned = self.owned.lock();
        let (next, result) = f(&owned.state)?;
        owned.state = next;
        owned.publish(None);
        Ok((Arc::clone(&owned.state.snapshot), result))
    }

    pub fn current_snapshot(&self) -> Arc<WorkspaceSnapshot> {
        Arc::clone(&self.owned.lock().state.snapshot)
    }

    pub fn current(&self) -> OwnedState {
        self.owned.lock().state.clone()
    }

    /// Store a new watch loop, stopping the previous one first
    pub fn replace_watcher(&self, handle: WatcherHandle) {
        let mut owned = self.owned.lock();
        if let Some(previous) = owned.watcher.take() {
            previous.stop();
        }
        if owned.closed {
            handle.stop();
        } else {
            owned.watcher = Some(handle);
        }
    }

    pub fn cancel_watcher(&self) {
        if let Some(previous) = self.owned.lock().watcher.take() {
            previous.stop();
        }
    }

    pub fn has_watcher(&self) -> bool {
        self.owned.lock().watcher.is_some()
    }

    /// Register an update subscriber. After `close` the stream ends at once.
    pub fn subscribe(&self) -> UpdateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut owned = self.owned.lock();
        if !owned.closed {
            owned.subscribers.push(tx);
        }
        UpdateStream { rx }
    }

    /// Republish the current state tagged with a notice
    pub fn publish_notice(&self, notice: UpdateNotice) {
        self.owned.lock().publish(Some(notice));
    }

    /// Stop the watch loop and end every update stream; idempotent
    pub fn close(&self) {
        let mut owned = self.owned.lock();
        owned.closed = true;
        if let Some(previous) = owned.watcher.take() {
            previous.stop();
        }
        owned.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.owned.lock().closed
    }
}

impl Default for WorkspaceStateOwner {
    fn default() -> Self {
        Self::new()
    }
}
