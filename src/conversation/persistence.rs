//! Conversation persistence
//!
//! [`SledConversationStore`] keeps one bincode record per conversation, keyed
//! by the 16 raw bytes of its id.

use crate::conversation::model::Conversation;
use crate::error::StorageError;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait ConversationPersistenceDriver: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Conversation>, StorageError>;
    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError>;
    async fn delete(&self, conversation: &Conversation) -> Result<(), StorageError>;
}

fn sled_error(context: &str, e: sled::Error) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, e),
    ))
}

/// Sled-backed conversation store
pub struct SledConversationStore {
    db: sled::Db,
}

impl SledConversationStore {
    /// Open (or create) a store at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| sled_error("Failed to open sled database", e))?;
        Ok(Self { db })
    }

    /// Store that lives only as long as this value
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| sled_error("Failed to open temporary database", e))?;
        Ok(Self { db })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

/// Run a sled operation on the blocking pool
async fn run_blocking<T, F>(op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(|e| {
        StorageError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Store task failed: {}", e),
        ))
    })?
}

#[async_trait]
impl ConversationPersistenceDriver for SledConversationStore {
    async fn load_all(&self) -> Result<Vec<Conversation>, StorageError> {
        let db = self.db.clone();
        let mut conversations = run_blocking(move || {
            db.iter()
                .map(|item| {
                    let (_, value) = item.map_err(|e| sled_error("Failed to iterate store", e))?;
                    bincode::deserialize::<Conversation>(&value).map_err(|e| {
                        StorageError::Serialization(format!(
                            "Failed to deserialize conversation: {}",
                            e
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        debug!(count = conversations.len(), "Loaded conversations");
        Ok(conversations)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let value = bincode::serialize(conversation).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize conversation: {}", e))
        })?;
        let db = self.db.clone();
        let key = *conversation.id.as_bytes();
        run_blocking(move || {
            db.insert(key, value)
                .map_err(|e| sled_error("Failed to save conversation", e))?;
            db.flush()
                .map_err(|e| sled_error("Failed to flush database", e))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let db = self.db.clone();
        let key = *conversation.id.as_bytes();
        run_blocking(move || {
            db.remove(key)
                .map_err(|e| sled_error("Failed to delete conversation", e))?;
            db.flush()
                .map_err(|e| sled_error("Failed to flush database", e))?;
            Ok(())
        })
        .await
    }
}
