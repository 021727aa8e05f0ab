//! Per-conversation symmetric keys: an in-memory cache in front of the
//! durable [`KeyVault`].
//!
//! A cached key is returned without consulting the vault, so the cache wins
//! for the life of the process. The vault is read on a cache miss, and
//! [`KeyStore::evict_all`] forces the next lookup back to it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use parley_shared::constants::SELF_TEST_PLAINTEXT;
use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::{ConversationId, KeyRecord, UserId};
use parley_store::KeyVault;

use crate::error::{ClientError, Result};
use crate::events::{DiagnosticEvent, EventBus};

/// Where a stored key ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Persistence {
    Durable,
    /// The vault write failed. The key works for this session only.
    MemoryOnly,
}

/// Result of [`KeyStore::exists`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPresence {
    pub in_memory: bool,
    pub in_durable: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// A durable record exists but cannot be used.
    pub corrupt: bool,
}

enum DurableKey {
    Absent,
    Found {
        key: SymmetricKey,
        created_at: Option<DateTime<Utc>>,
    },
    Corrupt(String),
}

pub struct KeyStore {
    cache: RwLock<HashMap<ConversationId, SymmetricKey>>,
    vault: Arc<dyn KeyVault>,
    events: EventBus,
}

impl KeyStore {
    pub fn new(vault: Arc<dyn KeyVault>, events: EventBus) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            vault,
            events,
        }
    }

    /// Cached key, else the durable one. Never generates.
    pub async fn get(&self, conversation_id: &ConversationId) -> Result<SymmetricKey> {
        if let Some(key) = self.cache.read().await.get(conversation_id) {
            return Ok(key.clone());
        }

        match self.read_durable(conversation_id)? {
            DurableKey::Found { key, .. } => {
                self.cache
                    .write()
                    .await
                    .insert(conversation_id.clone(), key.clone());
                debug!(conversation = %conversation_id, "Loaded key from vault");
                Ok(key)
            }
            DurableKey::Corrupt(reason) => {
                self.discard_corrupt(conversation_id, &reason);
                Err(ClientError::KeyNotFound(conversation_id.clone()))
            }
            DurableKey::Absent => Err(ClientError::KeyNotFound(conversation_id.clone())),
        }
    }

    pub async fn put(
        &self,
        conversation_id: &ConversationId,
        key: SymmetricKey,
        participants: &[UserId],
    ) -> Result<Persistence> {
        let mut cache = self.cache.write().await;
        let persistence = self.persist(conversation_id, &key, participants)?;
        cache.insert(conversation_id.clone(), key);
        Ok(persistence)
    }

    /// Return the existing key for the conversation, creating and storing one
    /// only if neither the cache nor the vault holds a usable key.
    pub async fn generate(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
    ) -> Result<SymmetricKey> {
        if let Some(key) = self.cache.read().await.get(conversation_id) {
            return Ok(key.clone());
        }

        // Re-check and write under one write lock so racing callers agree.
        let mut cache = self.cache.write().await;
        if let Some(key) = cache.get(conversation_id) {
            return Ok(key.clone());
        }

        match self.read_durable(conversation_id)? {
            DurableKey::Found { key, .. } => {
                cache.insert(conversation_id.clone(), key.clone());
                return Ok(key);
            }
            DurableKey::Corrupt(reason) => self.discard_corrupt(conversation_id, &reason),
            DurableKey::Absent => {}
        }

        let key = SymmetricKey::generate();
        self.persist(conversation_id, &key, participants)?;
        cache.insert(conversation_id.clone(), key.clone());

        info!(
            conversation = %conversation_id,
            fingerprint = %key.fingerprint(),
            "Generated conversation key"
        );
        Ok(key)
    }

    /// Forget the key in memory and in the vault.
    pub async fn clear(&self, conversation_id: &ConversationId) -> Result<()> {
        self.cache.write().await.remove(conversation_id);
        let removed = self.vault.remove(conversation_id)?;
        info!(conversation = %conversation_id, removed, "Cleared conversation key");
        Ok(())
    }

    /// Report where a key lives. Never fails and never modifies the vault.
    pub async fn exists(&self, conversation_id: &ConversationId) -> KeyPresence {
        let mut presence = KeyPresence {
            in_memory: self.cache.read().await.contains_key(conversation_id),
            ..KeyPresence::default()
        };

        match self.read_durable(conversation_id) {
            Ok(DurableKey::Found { created_at, .. }) => {
                presence.in_durable = true;
                presence.created_at = created_at;
            }
            Ok(DurableKey::Corrupt(reason)) => {
                debug!(conversation = %conversation_id, %reason, "Durable key record is corrupt");
                presence.corrupt = true;
            }
            Ok(DurableKey::Absent) => {}
            Err(e) => warn!(conversation = %conversation_id, error = %e, "Key vault read failed"),
        }

        presence
    }

    /// Round-trip a fixed plaintext through the stored key.
    pub async fn test(&self, conversation_id: &ConversationId) -> bool {
        let key = match self.get(conversation_id).await {
            Ok(key) => key,
            Err(e) => {
                debug!(conversation = %conversation_id, error = %e, "Key self-test: no usable key");
                return false;
            }
        };

        let passed = crypto::encrypt(&key, conversation_id, SELF_TEST_PLAINTEXT)
            .map_err(|e| e.to_string())
            .and_then(|envelope| crypto::decrypt(&envelope, &key).map_err(|e| e.to_string()))
            .map(|plaintext| plaintext == SELF_TEST_PLAINTEXT);

        match passed {
            Ok(true) => true,
            Ok(false) => {
                warn!(conversation = %conversation_id, "Key self-test returned different plaintext");
                false
            }
            Err(reason) => {
                warn!(conversation = %conversation_id, %reason, "Key self-test failed");
                false
            }
        }
    }

    /// Drop every cached key, leaving durable records alone. Returns how many
    /// were evicted.
    pub async fn evict_all(&self) -> usize {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        debug!(count, "Evicted cached keys");
        count
    }

    fn persist(
        &self,
        conversation_id: &ConversationId,
        key: &SymmetricKey,
        participants: &[UserId],
    ) -> Result<Persistence> {
        let record = KeyRecord::new(conversation_id, key, participants).to_json()?;

        match self.vault.save(conversation_id, &record) {
            Ok(()) => Ok(Persistence::Durable),
            Err(e) => {
                warn!(
                    conversation = %conversation_id,
                    error = %e,
                    "Key vault write failed, key kept for this session only"
                );
                self.events.emit(DiagnosticEvent::KeyNotPersisted {
                    conversation_id: conversation_id.clone(),
                });
                Ok(Persistence::MemoryOnly)
            }
        }
    }

    fn read_durable(&self, conversation_id: &ConversationId) -> Result<DurableKey> {
        let Some(raw) = self.vault.load(conversation_id)? else {
            return Ok(DurableKey::Absent);
        };

        let record = match KeyRecord::from_json(&raw) {
            Ok(record) => record,
            Err(e) => return Ok(DurableKey::Corrupt(format!("unreadable record: {e}"))),
        };

        if &record.conversation_id != conversation_id {
            return Ok(DurableKey::Corrupt(format!(
                "record belongs to conversation {}",
                record.conversation_id
            )));
        }

        match record.key() {
            Ok(key) => Ok(DurableKey::Found {
                key,
                created_at: record.created_at(),
            }),
            Err(e) => Ok(DurableKey::Corrupt(e.to_string())),
        }
    }

    fn discard_corrupt(&self, conversation_id: &ConversationId, reason: &str) {
        warn!(conversation = %conversation_id, %reason, "Discarding corrupt key record");
        if let Err(e) = self.vault.remove(conversation_id) {
            warn!(conversation = %conversation_id, error = %e, "Failed to remove corrupt key record");
        }
    }
}
