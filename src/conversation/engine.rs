//! Conversation Engine
//!
//! Send pipeline per call:
//!
//! ```text
//! Idle -> ContextResolved -> Streaming -> Committed
//!                                      -> CancelledNoCommit
//!                                      -> Failed
//! ```
//!
//! Every await before persistence is raced against the caller's cancellation
//! token. Nothing is committed until the stream completes and the updated
//! conversation is persisted; the cache is written only after that.

use crate::clock::{Clock, SystemClock};
use crate::context::{ContextBudget, ContextBuildResult, ContextPreparer};
use crate::conversation::cache::ConversationCache;
use crate::conversation::model::{Conversation, ConversationKey, Message, Role};
use crate::conversation::persistence::ConversationPersistenceDriver;
use crate::error::EngineError;
use crate::provider::{ChatMessage, CodexClient, StreamEvent};
use crate::types::{ConversationId, FileId};
use crate::workspace::snapshot::{DescriptorPathResolver, WorkspaceSnapshot};
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default cache bound
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Context to attach to a send
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub snapshot: Option<Arc<WorkspaceSnapshot>>,
    pub preferred_descriptor_ids: Vec<FileId>,
    /// Used only when the snapshot resolves no attachments
    pub explicit_paths: Vec<PathBuf>,
    pub budget: ContextBudget,
}

/// Progress reported to the caller while a send runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Context {
        attachments: Vec<PathBuf>,
        total_bytes: usize,
        total_tokens: usize,
    },
    /// Everything received so far
    Text { aggregate: String },
}

/// Result of a send that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed(Arc<Conversation>),
    Cancelled,
}

impl SendOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendOutcome::Cancelled)
    }

    pub fn conversation(&self) -> Option<&Arc<Conversation>> {
        match self {
            SendOutcome::Completed(conversation) => Some(conversation),
            SendOutcome::Cancelled => None,
        }
    }
}

pub type StreamCallback<'a> = &'a (dyn Fn(StreamDelta) + Send + Sync);

/// Releases the in-flight mark when a send ends, however it ends
struct SendGuard<'a> {
    cache: &'a Mutex<ConversationCache>,
    id: ConversationId,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.cache.lock().end_send(&self.id);
    }
}

pub struct ConversationEngine {
    cache: Mutex<ConversationCache>,
    persistence: Arc<dyn ConversationPersistenceDriver>,
    transport: Arc<dyn CodexClient>,
    preparer: ContextPreparer,
    clock: Arc<dyn Clock>,
}

impl ConversationEngine {
    pub fn new(
        persistence: Arc<dyn ConversationPersistenceDriver>,
        transport: Arc<dyn CodexClient>,
        preparer: ContextPreparer,
        capacity: usize,
    ) -> Self {
        Self::with_clock(persistence, transport, preparer, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        persistence: Arc<dyn ConversationPersistenceDriver>,
        transport: Arc<dyn CodexClient>,
        preparer: ContextPreparer,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: Mutex::new(ConversationCache::new(capacity)),
            persistence,
            transport,
            preparer,
            clock,
        }
    }

    /// Return the conversation for `key`, creating it if needed
    ///
    /// New conversations live only in the cache until their first commit.
    pub fn ensure_conversation(
        &self,
        key: &ConversationKey,
        resolver: Option<&dyn DescriptorPathResolver>,
    ) -> Result<Arc<Conversation>, EngineError> {
        if let Some(existing) = self.cache.lock().get_by_key(key) {
            return Ok(existing);
        }
        let paths = match key {
            ConversationKey::Path(path) => vec![path.clone()],
            ConversationKey::Descriptors(ids) => {
                let resolver = resolver.ok_or_else(|| {
                    EngineError::ContextLoadFailed(
                        "Descriptor conversations need a path resolver".to_string(),
                    )
                })?;
                let paths: Vec<PathBuf> = ids.iter().filter_map(|id| resolver.resolve(id)).collect();
                if paths.is_empty() {
                    return Err(EngineError::ContextLoadFailed(
                        "No descriptor resolved to a path".to_string(),
                    ));
                }
                paths
            }
        };

        let now = self.clock.now();
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get_by_key(key) {
            return Ok(existing);
        }
        let conversation = Arc::new(Conversation::new(key, paths, now));
        let evicted = cache.insert(Arc::clone(&conversation), Some(key.clone()), now);
        info!(
            conversation_id = %conversation.id,
            evicted = evicted.len(),
            "Created conversation"
        );
        Ok(conversation)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.cache.lock().get(id)
    }

    pub fn conversation_for(&self, key: &ConversationKey) -> Option<Arc<Conversation>> {
        self.cache.lock().get_by_key(key)
    }

    /// Cached conversations, most recently updated first
    pub fn conversations(&self) -> Vec<Arc<Conversation>> {
        self.cache.lock().conversations()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Load persisted conversations into free cache slots, newest first.
    /// Returns how many were added.
    pub async fn hydrate(&self) -> Result<usize, EngineError> {
        let mut persisted = self
            .persistence
            .load_all()
            .await
            .map_err(EngineError::persistence)?;
        persisted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut cache = self.cache.lock();
        let mut added = 0;
        for conversation in persisted {
            if cache.len() >= cache.capacity() {
                break;
            }
            if cache.contains(&conversation.id) {
                continue;
            }
            let key = conversation.key();
            let touched_at = conversation.updated_at;
            cache.insert(Arc::new(conversation), key, touched_at);
            added += 1;
        }
        info!(added, cached = cache.len(), "Hydrated conversation cache");
        Ok(added)
    }

    /// Delete through persistence, then drop the cache entry
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<(), EngineError> {
        let conversation = {
            let cache = self.cache.lock();
            if cache.is_in_flight(id) {
                return Err(EngineError::ConversationBusy(*id));
            }
            cache
                .get(id)
                .ok_or(EngineError::ConversationNotFound(*id))?
        };
        self.persistence
            .delete(&conversation)
            .await
            .map_err(EngineError::persistence)?;
        self.cache.lock().remove(id);
        info!(conversation_id = %id, "Deleted conversation");
        Ok(())
    }

    /// Send a user message and stream the assistant reply
    ///
    /// Returns [`SendOutcome::Cancelled`] when `cancel` fires before
    /// persistence starts; in that case nothing is committed or persisted.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub async fn send_message(
        &self,
        text: &str,
        conversation_id: ConversationId,
        context: Option<ContextRequest>,
        on_stream: Option<StreamCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        let (base, _guard) = {
            let mut cache = self.cache.lock();
            let base = cache
                .get(&conversation_id)
                .ok_or(EngineError::ConversationNotFound(conversation_id))?;
            if !cache.begin_send(conversation_id) {
                return Err(EngineError::ConversationBusy(conversation_id));
            }
            (
                base,
                SendGuard {
                    cache: &self.cache,
                    id: conversation_id,
                },
            )
        };
        let emit = |delta: StreamDelta| {
            if let Some(callback) = on_stream {
                callback(delta);
            }
        };

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.cancelled("Idle")),
            result = self.resolve_context(context.as_ref()) => result?,
        };
        debug!(
            attachments = resolved.attachments.len(),
            segments = resolved.encoded_segments.len(),
            "Send state: ContextResolved"
        );
        emit(StreamDelta::Context {
            attachments: resolved.attachment_paths(),
            total_bytes: resolved.total_bytes,
            total_tokens: resolved.total_tokens,
        });

        let mut messages: Vec<ChatMessage> = base
            .messages
            .iter()
            .map(|message| match message.role {
                Role::User => ChatMessage::user(message.text.clone()),
                Role::Assistant => ChatMessage::assistant(message.text.clone()),
            })
            .collect();
        messages.push(ChatMessage::user(text));

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.cancelled("ContextResolved")),
            result = self.transport.stream(messages, resolved.encoded_segments.clone()) => result?,
        };
        debug!(model = %self.transport.model_name(), "Send state: Streaming");

        let mut aggregate = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled("Streaming")),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::Token(token))) => {
                    aggregate.push_str(&token);
                    emit(StreamDelta::Text {
                        aggregate: aggregate.clone(),
                    });
                }
                Some(Ok(StreamEvent::Output(payload))) => {
                    aggregate = payload;
                    emit(StreamDelta::Text {
                        aggregate: aggregate.clone(),
                    });
                }
                Some(Ok(StreamEvent::Done)) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, received = aggregate.len(), "Send state: Failed");
                    return Err(EngineError::StreamingTransport(e));
                }
            }
        }
        drop(stream);

        if cancel.is_cancelled() {
            return Ok(self.cancelled("Streaming"));
        }

        let now = self.clock.now();
        let updated = base.with_exchange(
            Message::new(Role::User, text.to_string(), now)
                .with_attachments(resolved.attachment_paths()),
            Message::new(Role::Assistant, aggregate, now),
            now,
        );
        self.persistence.save(&updated).await.map_err(|e| {
            warn!(error = %e, "Send state: Failed (persistence)");
            EngineError::persistence(e)
        })?;

        let updated = Arc::new(updated);
        let evicted = self.cache.lock().commit(Arc::clone(&updated), now);
        debug!(
            messages = updated.message_count(),
            evicted = evicted.len(),
            "Send state: Committed"
        );
        Ok(SendOutcome::Completed(updated))
    }

    async fn resolve_context(
        &self,
        request: Option<&ContextRequest>,
    ) -> Result<ContextBuildResult, EngineError> {
        let Some(request) = request else {
            return Ok(ContextBuildResult::default());
        };

        if let Some(snapshot) = &request.snapshot {
            let preferred = (!request.preferred_descriptor_ids.is_empty())
                .then_some(request.preferred_descriptor_ids.as_slice());
            let resolved = self
                .preparer
                .prepare(snapshot, preferred, &request.budget)
                .await?;
            if !resolved.is_empty() || request.explicit_paths.is_empty() {
                return Ok(resolved);
            }
        }

        if request.explicit_paths.is_empty() {
            return Ok(ContextBuildResult::default());
        }
        self.preparer
            .load_paths(&request.explicit_paths, &request.budget)
            .await
    }

    fn cancelled(&self, state: &str) -> SendOutcome {
        debug!(from = state, "Send state: CancelledNoCommit");
        SendOutcome::Cancelled
    }
}
