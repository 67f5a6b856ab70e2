//! Conversation records

use crate::types::{ConversationId, FileId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Conversation";
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<PathBuf>,
}

impl Message {
    pub fn new(role: Role, text: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
            created_at,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Secondary lookup key: the file a conversation is about, or the
/// descriptor set it was started from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Path(PathBuf),
    Descriptors(BTreeSet<FileId>),
}

impl ConversationKey {
    pub fn descriptors<I: IntoIterator<Item = FileId>>(ids: I) -> Self {
        ConversationKey::Descriptors(ids.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub context_file_paths: Vec<PathBuf>,
    pub context_descriptor_ids: Option<Vec<FileId>>,
}

impl Conversation {
    pub fn new(key: &ConversationKey, context_file_paths: Vec<PathBuf>, now: DateTime<Utc>) -> Self {
        let context_descriptor_ids = match key {
            ConversationKey::Path(_) => None,
            ConversationKey::Descriptors(ids) => Some(ids.iter().copied().collect()),
        };
        Self {
            id: ConversationId::new(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            context_file_paths,
            context_descriptor_ids,
        }
    }

    /// Key this conversation is found under, if any
    pub fn key(&self) -> Option<ConversationKey> {
        match &self.context_descriptor_ids {
            Some(ids) if !ids.is_empty() => Some(ConversationKey::descriptors(ids.iter().copied())),
            _ => self
                .context_file_paths
                .first()
                .cloned()
                .map(ConversationKey::Path),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Copy with one user/assistant exchange appended. The first exchange
    /// also names an untitled conversation.
    pub fn with_exchange(&self, user: Message, assistant: Message, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if next.messages.is_empty() && next.title == DEFAULT_TITLE {
            if let Some(title) = derive_title(&user.text) {
                next.title = title;
            }
        }
        next.messages.push(user);
        next.messages.push(assistant);
        next.updated_at = now;
        next
    }
}

/// First non-blank line, at most 60 characters
pub fn derive_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    Some(line.chars().take(TITLE_MAX_CHARS).collect())
}
