//! Key lifecycle on top of the [`KeyStore`]: ensure, validate, regenerate.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::{ConversationId, UserId};

use crate::error::{ClientError, Result};
use crate::events::{DiagnosticEvent, EventBus};
use crate::key_store::{KeyPresence, KeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyHealth {
    Healthy,
    Missing,
    /// A record or cached key exists but fails to load or to round-trip.
    Corrupt,
}

/// Fingerprints before and after a forced regeneration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Regeneration {
    pub previous_fingerprint: Option<String>,
    pub fingerprint: String,
}

pub struct KeyManager {
    store: Arc<KeyStore>,
    events: EventBus,
}

impl KeyManager {
    pub fn new(store: Arc<KeyStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Existing key for the conversation, or a new one if there is none.
    pub async fn ensure_key(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
    ) -> Result<SymmetricKey> {
        self.store.generate(conversation_id, participants).await
    }

    pub async fn validate(&self, conversation_id: &ConversationId) -> bool {
        self.store.test(conversation_id).await
    }

    pub async fn presence(&self, conversation_id: &ConversationId) -> KeyPresence {
        self.store.exists(conversation_id).await
    }

    pub async fn health(&self, conversation_id: &ConversationId) -> KeyHealth {
        let presence = self.store.exists(conversation_id).await;
        if presence.corrupt {
            return KeyHealth::Corrupt;
        }
        if !presence.in_memory && !presence.in_durable {
            return KeyHealth::Missing;
        }
        if self.store.test(conversation_id).await {
            KeyHealth::Healthy
        } else {
            KeyHealth::Corrupt
        }
    }

    /// Replace the conversation key unconditionally.
    ///
    /// Every message encrypted under the old key becomes unreadable.
    pub async fn force_regenerate(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
    ) -> Result<Regeneration> {
        let previous_fingerprint = self
            .store
            .get(conversation_id)
            .await
            .ok()
            .map(|key| key.fingerprint());

        warn!(
            conversation = %conversation_id,
            previous = previous_fingerprint.as_deref().unwrap_or("none"),
            "Force-regenerating conversation key, old messages become unreadable"
        );

        self.store.clear(conversation_id).await?;
        let key = self.store.generate(conversation_id, participants).await?;

        if !self.store.test(conversation_id).await {
            return Err(ClientError::KeyCorrupt {
                conversation_id: conversation_id.clone(),
                reason: "regenerated key failed its self-test".into(),
            });
        }

        let fingerprint = key.fingerprint();
        info!(conversation = %conversation_id, %fingerprint, "Conversation key regenerated");

        self.events.emit(DiagnosticEvent::KeyRegenerated {
            conversation_id: conversation_id.clone(),
            previous_fingerprint: previous_fingerprint.clone(),
            fingerprint: fingerprint.clone(),
        });

        Ok(Regeneration {
            previous_fingerprint,
            fingerprint,
        })
    }

    pub fn fingerprint(key: &SymmetricKey) -> String {
        crypto::fingerprint(key.as_bytes())
    }

    /// Fingerprint of the stored key, for out-of-band comparison.
    pub async fn fingerprint_for(&self, conversation_id: &ConversationId) -> Result<String> {
        let key = self.store.get(conversation_id).await?;
        Ok(Self::fingerprint(&key))
    }
}
