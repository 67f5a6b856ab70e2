//! Error types for the workspace and conversation engines.

use crate::types::ConversationId;
use std::path::PathBuf;
use thiserror::Error;

/// Collaborator-level storage errors (filesystem, preference and conversation stores)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown file id: {0}")]
    UnknownFile(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by the AI transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport request failed: {0}")]
    RequestFailed(String),

    #[error("Transport authentication failed: {0}")]
    AuthFailed(String),

    #[error("Transport rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Malformed stream payload: {0}")]
    Protocol(String),

    #[error("Stream interrupted: {0}")]
    Interrupted(String),
}

/// Engine-level errors surfaced to callers
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("No workspace is open")]
    WorkspaceNotOpened,

    #[error("Path is not part of the workspace: {}", .0.display())]
    InvalidSelection(PathBuf),

    #[error("Context load failed: {0}")]
    ContextLoadFailed(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Streaming transport error: {0}")]
    StreamingTransport(#[from] TransportError),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Conversation {0} already has a send in flight")]
    ConversationBusy(ConversationId),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Cooperative cancellation. Not a failure; callers should not report it.
    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        EngineError::PersistenceFailed(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
