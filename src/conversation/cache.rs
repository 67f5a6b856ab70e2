//! Bounded conversation cache
//!
//! Entries are ordered by the time they were last written (from the injected
//! clock) with an insertion sequence as tie-break. Entries with a send in
//! flight are never evicted. The cache is a plain value; the engine keeps it
//! behind a lock.

use crate::conversation::model::{Conversation, ConversationKey};
use crate::types::ConversationId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    conversation: Arc<Conversation>,
    key: Option<ConversationKey>,
    touched_at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug)]
pub struct ConversationCache {
    capacity: usize,
    entries: HashMap<ConversationId, CacheEntry>,
    by_key: HashMap<ConversationKey, ConversationId>,
    in_flight: HashSet<ConversationId>,
    next_sequence: u64,
}

impl ConversationCache {
    /// A capacity of 0 is treated as 1
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            by_key: HashMap::new(),
            in_flight: HashSet::new(),
            next_sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.entries.get(id).map(|e| Arc::clone(&e.conversation))
    }

    pub fn get_by_key(&self, key: &ConversationKey) -> Option<Arc<Conversation>> {
        self.by_key.get(key).and_then(|id| self.get(id))
    }

    /// All cached conversations, most recently updated first
    pub fn conversations(&self) -> Vec<Arc<Conversation>> {
        let mut all: Vec<_> = self
            .entries
            .values()
            .map(|e| Arc::clone(&e.conversation))
            .collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Insert (or replace) an entry, then evict down to capacity.
    /// Returns the evicted ids.
    pub fn insert(
        &mut self,
        conversation: Arc<Conversation>,
        key: Option<ConversationKey>,
        touched_at: DateTime<Utc>,
    ) -> Vec<ConversationId> {
        let id = conversation.id;
        if let Some(previous) = self.entries.remove(&id) {
            if let Some(previous_key) = previous.key {
                self.by_key.remove(&previous_key);
            }
        }
        if let Some(key) = &key {
            if let Some(displaced) = self.by_key.insert(key.clone(), id) {
                if displaced != id {
                    if let Some(entry) = self.entries.get_mut(&displaced) {
                        entry.key = None;
                    }
                }
            }
        }
        let sequence = self.bump_sequence();
        self.entries.insert(
            id,
            CacheEntry {
                conversation,
                key,
                touched_at,
                sequence,
            },
        );
        self.evict_to_capacity(id)
    }

    /// Replace the conversation of a cached entry and mark it as just written
    pub fn commit(
        &mut self,
        conversation: Arc<Conversation>,
        touched_at: DateTime<Utc>,
    ) -> Vec<ConversationId> {
        let id = conversation.id;
        let key = match self.entries.get(&id) {
            Some(entry) => entry.key.clone(),
            None => conversation.key(),
        };
        self.insert(conversation, key, touched_at)
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<Arc<Conversation>> {
        let entry = self.entries.remove(id)?;
        if let Some(key) = entry.key {
            if self.by_key.get(&key) == Some(id) {
                self.by_key.remove(&key);
            }
        }
        Some(entry.conversation)
    }

    /// Mark a send as started; false if one is already running
    pub fn begin_send(&mut self, id: ConversationId) -> bool {
        self.in_flight.insert(id)
    }

    pub fn end_send(&mut self, id: &ConversationId) {
        self.in_flight.remove(id);
    }

    pub fn is_in_flight(&self, id: &ConversationId) -> bool {
        self.in_flight.contains(id)
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn evict_to_capacity(&mut self, protect: ConversationId) -> Vec<ConversationId> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(id, _)| **id != protect && !self.in_flight.contains(*id))
                .min_by_key(|(_, entry)| (entry.touched_at, entry.sequence))
                .map(|(id, _)| *id);
            let Some(victim) = victim else {
                warn!(
                    len = self.entries.len(),
                    capacity = self.capacity,
                    "Conversation cache over capacity, every entry is busy"
                );
                break;
            };
            self.remove(&victim);
            debug!(conversation_id = %victim, "Evicted conversation");
            evicted.push(victim);
        }
        evicted
    }
}
