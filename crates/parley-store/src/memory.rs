//! In-process implementation of both storage seams.
//!
//! Mirrors [`LocalStore`](crate::LocalStore) semantics without SQLite. Key
//! writes can be made to fail on demand to exercise degraded persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;
use uuid::Uuid;

use parley_shared::ConversationId;

use crate::backend::{KeyVault, MessageStore, FEED_CAPACITY};
use crate::error::{Result, StoreError};
use crate::models::MessageRow;

pub struct MemoryStore {
    keys: Mutex<HashMap<ConversationId, String>>,
    messages: Mutex<Vec<MessageRow>>,
    feed: broadcast::Sender<MessageRow>,
    fail_key_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            keys: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            feed,
            fail_key_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent [`KeyVault::save`] fail with an I/O error.
    pub fn set_fail_key_writes(&self, fail: bool) {
        self.fail_key_writes.store(fail, Ordering::SeqCst);
    }

    fn keys(&self) -> Result<MutexGuard<'_, HashMap<ConversationId, String>>> {
        self.keys.lock().map_err(|_| StoreError::Poisoned)
    }

    fn messages(&self) -> Result<MutexGuard<'_, Vec<MessageRow>>> {
        self.messages.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyVault for MemoryStore {
    fn load(&self, conversation_id: &ConversationId) -> Result<Option<String>> {
        Ok(self.keys()?.get(conversation_id).cloned())
    }

    fn save(&self, conversation_id: &ConversationId, record: &str) -> Result<()> {
        if self.fail_key_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "key vault write refused",
            )));
        }
        self.keys()?
            .insert(conversation_id.clone(), record.to_string());
        Ok(())
    }

    fn remove(&self, conversation_id: &ConversationId) -> Result<bool> {
        Ok(self.keys()?.remove(conversation_id).is_some())
    }
}

impl MessageStore for MemoryStore {
    fn insert(&self, row: &MessageRow) -> Result<()> {
        self.messages()?.push(row.clone());
        let _ = self.feed.send(row.clone());
        Ok(())
    }

    fn select(&self, conversation_id: &ConversationId, limit: u32) -> Result<Vec<MessageRow>> {
        let messages = self.messages()?;
        // Stable sort keeps insertion order for equal timestamps.
        let mut rows: Vec<MessageRow> = messages
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        let skip = rows.len().saturating_sub(limit as usize);
        Ok(rows.split_off(skip))
    }

    fn delete(&self, ids: &[Uuid]) -> Result<usize> {
        let mut messages = self.messages()?;
        let before = messages.len();
        messages.retain(|m| !ids.contains(&m.id));
        Ok(before - messages.len())
    }

    fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<usize> {
        let mut messages = self.messages()?;
        let before = messages.len();
        messages.retain(|m| &m.conversation_id != conversation_id);
        Ok(before - messages.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageRow> {
        self.feed.subscribe()
    }
}
