//! Storage seams consumed by the client service.
//!
//! Both traits are synchronous: implementations are local and fast, and the
//! async client code calls them without holding any lock across `.await`.

use tokio::sync::broadcast;
use uuid::Uuid;

use parley_shared::ConversationId;

use crate::error::Result;
use crate::models::MessageRow;

/// Durable store for opaque, per-conversation key records.
///
/// Records are stored as the caller hands them over. The vault never parses
/// them, so a corrupt record round-trips unchanged and is the caller's to
/// detect and remove.
pub trait KeyVault: Send + Sync {
    /// Load the raw record for a conversation, `None` when absent.
    fn load(&self, conversation_id: &ConversationId) -> Result<Option<String>>;

    /// Insert or replace the raw record for a conversation.
    fn save(&self, conversation_id: &ConversationId, record: &str) -> Result<()>;

    /// Remove the record. Returns `true` if one existed.
    fn remove(&self, conversation_id: &ConversationId) -> Result<bool>;
}

/// Message record store with an insert change feed.
pub trait MessageStore: Send + Sync {
    /// Persist a row and announce it on the change feed.
    fn insert(&self, row: &MessageRow) -> Result<()>;

    /// Most recent `limit` rows of a conversation, oldest first.
    fn select(&self, conversation_id: &ConversationId, limit: u32) -> Result<Vec<MessageRow>>;

    /// Delete rows by id. Returns how many were removed.
    fn delete(&self, ids: &[Uuid]) -> Result<usize>;

    /// Delete every row of a conversation. Returns how many were removed.
    fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<usize>;

    /// Subscribe to rows inserted from now on, across all conversations.
    /// Stores shared with other writers also announce their rows, possibly
    /// after a polling delay.
    fn subscribe(&self) -> broadcast::Receiver<MessageRow>;
}

/// Capacity of the insert feed before slow subscribers start lagging.
pub const FEED_CAPACITY: usize = 256;
