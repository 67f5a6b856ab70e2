//! Conversations: records, the bounded cache, persistence and the send engine.

pub mod cache;
pub mod engine;
pub mod model;
pub mod persistence;

pub use cache::ConversationCache;
pub use engine::{
    ContextRequest, ConversationEngine, SendOutcome, StreamCallback, StreamDelta,
    DEFAULT_CACHE_CAPACITY,
};
pub use model::{derive_title, Conversation, ConversationKey, Message, Role, DEFAULT_TITLE};
pub use persistence::{ConversationPersistenceDriver, SledConversationStore};
