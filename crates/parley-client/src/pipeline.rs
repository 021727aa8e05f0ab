//! Chat message pipeline.
//!
//! Send path: rate limit, ensure the conversation key, encrypt, store the
//! marked payload. Receive path: select the visible page, decrypt what can be
//! decrypted and replace the rest with a placeholder. Rows are never dropped,
//! and every batch carries an aggregate health verdict so the caller can pick
//! a recovery action without inspecting individual rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::constants::MAX_MESSAGE_SIZE;
use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::envelope::{self, Payload};
use parley_shared::error::{CryptoError, DecryptionError, EnvelopeDefect};
use parley_shared::{ConversationId, EncryptedEnvelope, UserId};
use parley_store::{MessageRow, MessageStore};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{DiagnosticEvent, EventBus};
use crate::lifecycle::{KeyManager, Regeneration};
use crate::rate_limit::RateLimiter;

pub const PLACEHOLDER_MISSING_KEY: &str =
    "[Encrypted message - decryption key not available on this device. Try refreshing.]";
pub const PLACEHOLDER_KEY_MISMATCH: &str =
    "[Encrypted message - encrypted with a different key. The conversation key may have been rotated; consider clearing unreadable messages.]";
pub const PLACEHOLDER_CORRUPTED: &str =
    "[Encrypted message - corrupted data. Clear unreadable messages to remove it.]";

/// Why an encrypted row could not be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    MissingKey,
    KeyMismatch,
    Corrupted,
}

impl FailureKind {
    pub fn placeholder(self) -> &'static str {
        match self {
            Self::MissingKey => PLACEHOLDER_MISSING_KEY,
            Self::KeyMismatch => PLACEHOLDER_KEY_MISMATCH,
            Self::Corrupted => PLACEHOLDER_CORRUPTED,
        }
    }
}

impl From<&DecryptionError> for FailureKind {
    fn from(e: &DecryptionError) -> Self {
        match e {
            DecryptionError::AuthenticationFailure => Self::KeyMismatch,
            DecryptionError::MalformedEnvelope(_) => Self::Corrupted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    Plain,
    Decrypted,
    Failed(FailureKind),
}

/// A stored row as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Plaintext, or a placeholder when `status` is `Failed`.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl DecodedMessage {
    pub fn failure(&self) -> Option<FailureKind> {
        match self.status {
            MessageStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "level", rename_all = "kebab-case")]
pub enum BatchHealth {
    Clean,
    /// Some encrypted rows failed. Low severity, a targeted purge fixes it.
    Partial { failed: usize, encrypted: usize },
    /// Every encrypted row failed, most likely a missing or replaced key.
    Total { failed: usize, cause: FailureKind },
}

impl BatchHealth {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn recommended_action(&self) -> RecoveryAction {
        match self {
            Self::Clean => RecoveryAction::None,
            Self::Partial { .. } => RecoveryAction::PurgeUnreadable,
            Self::Total { cause, .. } => match cause {
                FailureKind::MissingKey => RecoveryAction::Refresh,
                FailureKind::KeyMismatch => RecoveryAction::Regenerate,
                FailureKind::Corrupted => RecoveryAction::PurgeUnreadable,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    None,
    /// Reload the key from durable storage and fetch again.
    Refresh,
    /// Delete the encrypted rows that fail to decrypt.
    PurgeUnreadable,
    /// Drop all encrypted rows and start over with a fresh key.
    Regenerate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedBatch {
    pub conversation_id: ConversationId,
    pub messages: Vec<DecodedMessage>,
    pub health: BatchHealth,
}

impl DecryptedBatch {
    pub fn recommended_action(&self) -> RecoveryAction {
        self.health.recommended_action()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DecodedMessage> {
        self.messages.iter().filter(|m| m.failure().is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SendMode {
    Encrypted,
    /// Stored without encryption because the key or cipher step failed.
    PlaintextFallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub mode: SendMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReset {
    pub deleted: usize,
    pub regeneration: Regeneration,
}

pub struct ChatPipeline {
    keys: Arc<KeyManager>,
    messages: Arc<dyn MessageStore>,
    limiter: RateLimiter,
    events: EventBus,
    history_limit: u32,
    plaintext_fallback: bool,
}

impl ChatPipeline {
    pub fn new(
        keys: Arc<KeyManager>,
        messages: Arc<dyn MessageStore>,
        events: EventBus,
        config: &ClientConfig,
    ) -> Self {
        Self {
            keys,
            messages,
            limiter: RateLimiter::new(config.send_rate_max, config.send_rate_window_secs),
            events,
            history_limit: config.history_limit,
            plaintext_fallback: config.plaintext_fallback,
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        participants: &[UserId],
        text: &str,
    ) -> Result<SendReceipt> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let decision = self.limiter.check(sender.as_str());
        if !decision.allowed {
            return Err(ClientError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        // Only stored messages count against the sender.
        let result = self.deliver(conversation_id, sender, participants, text).await;
        if result.is_err() {
            self.limiter.refund(sender.as_str());
        }
        result
    }

    /// Most recent page of the conversation, oldest first, decrypted where
    /// possible.
    pub async fn fetch(&self, conversation_id: &ConversationId) -> Result<DecryptedBatch> {
        let batch = self.decode_page(conversation_id, self.history_limit).await?;
        self.report(&batch);
        Ok(batch)
    }

    /// Delete encrypted rows that fail to decrypt for a reason other than a
    /// missing key. Returns the number deleted.
    pub async fn purge_unreadable(&self, conversation_id: &ConversationId) -> Result<usize> {
        let batch = self.decode_page(conversation_id, u32::MAX).await?;
        let ids: Vec<Uuid> = batch
            .failed()
            .filter(|m| m.failure() != Some(FailureKind::MissingKey))
            .map(|m| m.id)
            .collect();

        let deleted = self.messages.delete(&ids)?;
        info!(conversation = %conversation_id, deleted, "Purged unreadable messages");
        Ok(deleted)
    }

    /// Delete every encrypted row of the conversation and replace its key.
    /// Plaintext rows are kept.
    pub async fn purge_encrypted_and_regenerate(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
    ) -> Result<ConversationReset> {
        let ids: Vec<Uuid> = self
            .messages
            .select(conversation_id, u32::MAX)?
            .into_iter()
            .filter(MessageRow::is_encrypted)
            .map(|row| row.id)
            .collect();

        let deleted = self.messages.delete(&ids)?;
        warn!(conversation = %conversation_id, deleted, "Deleted all encrypted messages");

        let regeneration = self.keys.force_regenerate(conversation_id, participants).await?;
        Ok(ConversationReset {
            deleted,
            regeneration,
        })
    }

    /// Delete every row of the conversation, then its key.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<usize> {
        let deleted = self.messages.delete_conversation(conversation_id)?;
        self.keys.store().clear(conversation_id).await?;
        info!(conversation = %conversation_id, deleted, "Conversation deleted");
        Ok(deleted)
    }

    pub fn delete_message(&self, message_id: Uuid) -> Result<bool> {
        Ok(self.messages.delete(&[message_id])? > 0)
    }

    /// Follow new rows of one conversation. Subscribe before the initial
    /// [`fetch`](Self::fetch) so no insert is missed in between.
    pub fn watch(&self, conversation_id: &ConversationId) -> ConversationWatch<'_> {
        ConversationWatch {
            pipeline: self,
            conversation_id: conversation_id.clone(),
            feed: self.messages.subscribe(),
        }
    }

    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        participants: &[UserId],
        text: &str,
    ) -> Result<SendReceipt> {
        let (payload, mode) = match self.seal(conversation_id, participants, text).await {
            Ok(payload) => (payload, SendMode::Encrypted),
            Err(e) => self.downgrade(conversation_id, text, e)?,
        };

        let row = MessageRow::new(conversation_id.clone(), sender.clone(), payload);
        self.messages.insert(&row)?;

        debug!(
            conversation = %conversation_id,
            message = %row.id,
            encrypted = matches!(mode, SendMode::Encrypted),
            "Message stored"
        );

        Ok(SendReceipt {
            message_id: row.id,
            mode,
        })
    }

    async fn seal(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
        text: &str,
    ) -> Result<String> {
        let key = self.keys.ensure_key(conversation_id, participants).await?;
        let envelope = crypto::encrypt(&key, conversation_id, text)?;
        Ok(envelope.to_payload())
    }

    fn downgrade(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        cause: ClientError,
    ) -> Result<(String, SendMode)> {
        let reason = cause.to_string();

        if !self.plaintext_fallback {
            warn!(conversation = %conversation_id, %reason, "Encryption unavailable, send refused");
            return Err(ClientError::EncryptionUnavailable { reason });
        }

        // Stored as-is this would read back as a corrupted envelope.
        if envelope::is_encrypted_payload(text) {
            return Err(ClientError::EncryptionUnavailable {
                reason: format!("{reason}; plaintext looks like an encrypted payload"),
            });
        }

        warn!(conversation = %conversation_id, %reason, "Encryption unavailable, sending plaintext");
        self.events.emit(DiagnosticEvent::PlaintextFallback {
            conversation_id: conversation_id.clone(),
            reason: reason.clone(),
        });

        Ok((text.to_string(), SendMode::PlaintextFallback { reason }))
    }

    async fn decode_page(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<DecryptedBatch> {
        let rows = self.messages.select(conversation_id, limit)?;

        let key = if rows.iter().any(MessageRow::is_encrypted) {
            match self.keys.store().get(conversation_id).await {
                Ok(key) => Some(key),
                Err(ClientError::KeyNotFound(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let messages: Vec<DecodedMessage> = rows
            .into_iter()
            .map(|row| decode_row(row, key.as_ref()))
            .collect();

        let health = assess(&messages, key.is_some());
        Ok(DecryptedBatch {
            conversation_id: conversation_id.clone(),
            messages,
            health,
        })
    }

    fn report(&self, batch: &DecryptedBatch) {
        let action = batch.recommended_action();
        match batch.health {
            BatchHealth::Clean => return,
            BatchHealth::Partial { failed, encrypted } => info!(
                conversation = %batch.conversation_id,
                failed,
                encrypted,
                ?action,
                "Some messages could not be decrypted"
            ),
            BatchHealth::Total { failed, cause } => warn!(
                conversation = %batch.conversation_id,
                failed,
                ?cause,
                ?action,
                "No encrypted message could be decrypted"
            ),
        }

        self.events.emit(DiagnosticEvent::BatchDegraded {
            conversation_id: batch.conversation_id.clone(),
            health: batch.health,
            action,
        });
    }
}

fn decode_row(row: MessageRow, key: Option<&SymmetricKey>) -> DecodedMessage {
    let (content, status) = match envelope::classify(&row.payload) {
        Payload::Plain(text) => (text.to_string(), MessageStatus::Plain),
        Payload::Encrypted(parsed) => match open(&row, parsed, key) {
            Ok(text) => (text, MessageStatus::Decrypted),
            Err(kind) => {
                debug!(message = %row.id, ?kind, "Message could not be decrypted");
                (kind.placeholder().to_string(), MessageStatus::Failed(kind))
            }
        },
    };

    DecodedMessage {
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        content,
        created_at: row.created_at,
        status,
    }
}

fn open(
    row: &MessageRow,
    parsed: std::result::Result<EncryptedEnvelope, EnvelopeDefect>,
    key: Option<&SymmetricKey>,
) -> std::result::Result<String, FailureKind> {
    let envelope = parsed.map_err(|defect| {
        debug!(message = %row.id, %defect, "Malformed payload marker");
        FailureKind::Corrupted
    })?;

    let key = key.ok_or(FailureKind::MissingKey)?;

    // The cipher does not authenticate the embedded id, so compare it here.
    if envelope.conversation_id != row.conversation_id {
        debug!(
            message = %row.id,
            envelope_conversation = %envelope.conversation_id,
            "Envelope was sealed for another conversation"
        );
        return Err(FailureKind::KeyMismatch);
    }

    crypto::decrypt(&envelope, key).map_err(|e| FailureKind::from(&e))
}

fn assess(messages: &[DecodedMessage], key_present: bool) -> BatchHealth {
    let encrypted = messages
        .iter()
        .filter(|m| m.status != MessageStatus::Plain)
        .count();
    let failures: Vec<FailureKind> = messages.iter().filter_map(DecodedMessage::failure).collect();
    let failed = failures.len();

    if failed == 0 {
        BatchHealth::Clean
    } else if failed < encrypted {
        BatchHealth::Partial { failed, encrypted }
    } else {
        let cause = if !key_present {
            FailureKind::MissingKey
        } else if failures.contains(&FailureKind::KeyMismatch) {
            FailureKind::KeyMismatch
        } else {
            FailureKind::Corrupted
        };
        BatchHealth::Total { failed, cause }
    }
}

/// Re-fetches a conversation page whenever a row for it is inserted, here or
/// by another writer to the same database.
pub struct ConversationWatch<'a> {
    pipeline: &'a ChatPipeline,
    conversation_id: ConversationId,
    feed: broadcast::Receiver<MessageRow>,
}

impl ConversationWatch<'_> {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Wait for the next insert into the conversation and return the fresh
    /// page. `None` once the feed has closed.
    pub async fn next_batch(&mut self) -> Result<Option<DecryptedBatch>> {
        loop {
            match self.feed.recv().await {
                Ok(row) if row.conversation_id == self.conversation_id => break,
                Ok(_) => continue,
                // Missed rows may include ours, so refetch.
                Err(RecvError::Lagged(skipped)) => {
                    warn!(conversation = %self.conversation_id, skipped, "Change feed lagged");
                    break;
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }

        self.pipeline.fetch(&self.conversation_id).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_store::KeyStore;
    use parley_store::{KeyVault, MemoryStore, StoreError};

    struct Harness {
        backend: Arc<MemoryStore>,
        events: EventBus,
        pipeline: ChatPipeline,
    }

    fn harness(config: ClientConfig) -> Harness {
        let backend = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let store = Arc::new(KeyStore::new(backend.clone(), events.clone()));
        let keys = Arc::new(KeyManager::new(store, events.clone()));
        let pipeline = ChatPipeline::new(keys, backend.clone(), events.clone(), &config);
        Harness {
            backend,
            events,
            pipeline,
        }
    }

    fn cid() -> ConversationId {
        ConversationId::from("c1")
    }

    fn alice() -> UserId {
        UserId::from("alice")
    }

    #[tokio::test]
    async fn test_send_stores_marked_payload() {
        let h = harness(ClientConfig::default());
        let receipt = h.pipeline.send(&cid(), &alice(), &[], "hello").await.unwrap();
        assert_eq!(receipt.mode, SendMode::Encrypted);

        let rows = h.backend.select(&cid(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].payload.starts_with("[ENCRYPTED:c1:"));
        assert!(!rows[0].payload.contains("hello"));

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(batch.messages[0].content, "hello");
        assert_eq!(batch.messages[0].status, MessageStatus::Decrypted);
        assert!(batch.health.is_clean());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = harness(ClientConfig::default());
        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], "   ").await,
            Err(ClientError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_gate() {
        let config = ClientConfig {
            send_rate_max: 2,
            ..ClientConfig::default()
        };
        let h = harness(config);
        h.pipeline.send(&cid(), &alice(), &[], "1").await.unwrap();
        h.pipeline.send(&cid(), &alice(), &[], "2").await.unwrap();

        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], "3").await,
            Err(ClientError::RateLimited { .. })
        ));
        assert_eq!(h.backend.select(&cid(), 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_total_failure() {
        let h = harness(ClientConfig::default());
        h.pipeline.send(&cid(), &alice(), &[], "secret").await.unwrap();
        h.pipeline.keys().store().clear(&cid()).await.unwrap();

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(batch.messages[0].content, PLACEHOLDER_MISSING_KEY);
        assert_eq!(
            batch.health,
            BatchHealth::Total {
                failed: 1,
                cause: FailureKind::MissingKey
            }
        );
        assert_eq!(batch.recommended_action(), RecoveryAction::Refresh);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_corrupted() {
        let h = harness(ClientConfig::default());
        h.pipeline.send(&cid(), &alice(), &[], "fine").await.unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), "[ENCRYPTED:c1:only-two".into()))
            .unwrap();

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[1].status, MessageStatus::Failed(FailureKind::Corrupted));
        assert_eq!(batch.messages[1].content, PLACEHOLDER_CORRUPTED);
        assert_eq!(
            batch.health,
            BatchHealth::Partial {
                failed: 1,
                encrypted: 2
            }
        );
        assert_eq!(batch.recommended_action(), RecoveryAction::PurgeUnreadable);
    }

    #[tokio::test]
    async fn test_one_event_per_degraded_batch() {
        let h = harness(ClientConfig::default());
        let mut rx = h.events.subscribe();
        let stale = SymmetricKey::generate();
        for text in ["a", "b", "c"] {
            let envelope = crypto::encrypt(&stale, &cid(), text).unwrap();
            h.backend
                .insert(&MessageRow::new(cid(), alice(), envelope.to_payload()))
                .unwrap();
        }
        h.pipeline.keys().ensure_key(&cid(), &[]).await.unwrap();

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(
            batch.health,
            BatchHealth::Total {
                failed: 3,
                cause: FailureKind::KeyMismatch
            }
        );

        assert!(matches!(
            rx.try_recv().unwrap(),
            DiagnosticEvent::BatchDegraded {
                action: RecoveryAction::Regenerate,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_envelope_from_other_conversation_is_mismatch() {
        let h = harness(ClientConfig::default());
        let key = h.pipeline.keys().ensure_key(&cid(), &[]).await.unwrap();
        let foreign = crypto::encrypt(&key, &ConversationId::from("c2"), "moved").unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), foreign.to_payload()))
            .unwrap();

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(
            batch.messages[0].status,
            MessageStatus::Failed(FailureKind::KeyMismatch)
        );
    }

    struct BrokenVault;

    impl KeyVault for BrokenVault {
        fn load(&self, _: &ConversationId) -> parley_store::Result<Option<String>> {
            Err(StoreError::Poisoned)
        }

        fn save(&self, _: &ConversationId, _: &str) -> parley_store::Result<()> {
            Err(StoreError::Poisoned)
        }

        fn remove(&self, _: &ConversationId) -> parley_store::Result<bool> {
            Err(StoreError::Poisoned)
        }
    }

    fn broken_key_harness(config: ClientConfig) -> Harness {
        let backend = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let store = Arc::new(KeyStore::new(Arc::new(BrokenVault), events.clone()));
        let keys = Arc::new(KeyManager::new(store, events.clone()));
        let pipeline = ChatPipeline::new(keys, backend.clone(), events.clone(), &config);
        Harness {
            backend,
            events,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_unavailable_encryption_refuses_send() {
        let h = broken_key_harness(ClientConfig::default());

        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], "hi").await,
            Err(ClientError::EncryptionUnavailable { .. })
        ));
        assert!(h.backend.select(&cid(), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plaintext_fallback_is_reported() {
        let config = ClientConfig {
            plaintext_fallback: true,
            ..ClientConfig::default()
        };
        let h = broken_key_harness(config);
        let mut rx = h.events.subscribe();

        let receipt = h.pipeline.send(&cid(), &alice(), &[], "hi").await.unwrap();

        assert!(matches!(receipt.mode, SendMode::PlaintextFallback { .. }));
        assert_eq!(h.backend.select(&cid(), 10).unwrap()[0].payload, "hi");
        assert!(matches!(
            rx.try_recv().unwrap(),
            DiagnosticEvent::PlaintextFallback { .. }
        ));
    }

    #[tokio::test]
    async fn test_fallback_refuses_marker_lookalike() {
        let config = ClientConfig {
            plaintext_fallback: true,
            ..ClientConfig::default()
        };
        let h = broken_key_harness(config);

        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], "[ENCRYPTED:x:y:z]").await,
            Err(ClientError::EncryptionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_vault_write_failure_still_encrypts() {
        let h = harness(ClientConfig::default());
        h.backend.set_fail_key_writes(true);

        let receipt = h.pipeline.send(&cid(), &alice(), &[], "hi").await.unwrap();
        assert_eq!(receipt.mode, SendMode::Encrypted);
        assert_eq!(h.pipeline.fetch(&cid()).await.unwrap().messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_purge_unreadable_keeps_missing_key_rows() {
        let h = harness(ClientConfig::default());
        h.pipeline.send(&cid(), &alice(), &[], "good").await.unwrap();
        let stale = crypto::encrypt(&SymmetricKey::generate(), &cid(), "old").unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), stale.to_payload()))
            .unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), "plain".into()))
            .unwrap();

        assert_eq!(h.pipeline.purge_unreadable(&cid()).await.unwrap(), 1);
        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert!(batch.health.is_clean());

        // With the key gone nothing is deleted.
        h.pipeline.keys().store().clear(&cid()).await.unwrap();
        assert_eq!(h.pipeline.purge_unreadable(&cid()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_encrypted_and_regenerate() {
        let h = harness(ClientConfig::default());
        h.pipeline.send(&cid(), &alice(), &[], "one").await.unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), "plain".into()))
            .unwrap();
        let before = h.pipeline.keys().fingerprint_for(&cid()).await.unwrap();

        let reset = h
            .pipeline
            .purge_encrypted_and_regenerate(&cid(), &[])
            .await
            .unwrap();

        assert_eq!(reset.deleted, 1);
        assert_eq!(reset.regeneration.previous_fingerprint, Some(before.clone()));
        assert_ne!(reset.regeneration.fingerprint, before);
        let rows = h.backend.select(&cid(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, "plain");
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades_to_key() {
        let h = harness(ClientConfig::default());
        h.pipeline.send(&cid(), &alice(), &[], "bye").await.unwrap();

        assert_eq!(h.pipeline.delete_conversation(&cid()).await.unwrap(), 1);
        assert!(h.backend.load(&cid()).unwrap().is_none());
        assert!(h.pipeline.fetch(&cid()).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_message() {
        let h = harness(ClientConfig::default());
        let receipt = h.pipeline.send(&cid(), &alice(), &[], "oops").await.unwrap();

        assert!(h.pipeline.delete_message(receipt.message_id).unwrap());
        assert!(!h.pipeline.delete_message(receipt.message_id).unwrap());
    }

    #[tokio::test]
    async fn test_history_limit_keeps_most_recent() {
        let config = ClientConfig {
            history_limit: 2,
            ..ClientConfig::default()
        };
        let h = harness(config);
        for text in ["1", "2", "3"] {
            h.pipeline.send(&cid(), &alice(), &[], text).await.unwrap();
        }

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        let contents: Vec<&str> = batch.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_watch_refetches_on_insert() {
        let h = harness(ClientConfig::default());
        let mut watch = h.pipeline.watch(&cid());

        h.pipeline
            .send(&ConversationId::from("other"), &alice(), &[], "elsewhere")
            .await
            .unwrap();
        h.pipeline.send(&cid(), &alice(), &[], "here").await.unwrap();

        let batch = watch.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.conversation_id, cid());
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].content, "here");
    }

    #[tokio::test]
    async fn test_fetch_reads_plain_aes_gcm_payload() {
        let h = harness(ClientConfig::default());
        let key_bytes: Vec<u8> = (0u8..32).collect();
        h.pipeline
            .keys()
            .store()
            .put(&cid(), SymmetricKey::from_bytes(&key_bytes).unwrap(), &[])
            .await
            .unwrap();
        // AES-256-GCM without associated data, nonce [7; 12]
        h.backend
            .insert(&MessageRow::new(
                cid(),
                alice(),
                "[ENCRYPTED:c1:BwcHBwcHBwcHBwcH:Zw/KMADChmNBd3kjPtvtflwkKTq/]".into(),
            ))
            .unwrap();

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(batch.messages[0].status, MessageStatus::Decrypted);
        assert_eq!(batch.messages[0].content, "hello");
        assert!(batch.health.is_clean());
    }

    #[tokio::test]
    async fn test_all_malformed_rows_is_total_corruption() {
        let h = harness(ClientConfig::default());
        let key = h.pipeline.keys().ensure_key(&cid(), &[]).await.unwrap();
        h.backend
            .insert(&MessageRow::new(cid(), alice(), "plain".into()))
            .unwrap();
        for text in ["x", "y"] {
            let mut envelope = crypto::encrypt(&key, &cid(), text).unwrap();
            // Valid base64, but 8 bytes instead of 12.
            envelope.nonce = parley_shared::codec::encode(&[0u8; 8]);
            h.backend
                .insert(&MessageRow::new(cid(), alice(), envelope.to_payload()))
                .unwrap();
        }

        let batch = h.pipeline.fetch(&cid()).await.unwrap();
        assert_eq!(
            batch.health,
            BatchHealth::Total {
                failed: 2,
                cause: FailureKind::Corrupted
            }
        );
        assert_eq!(batch.recommended_action(), RecoveryAction::PurgeUnreadable);
        assert_eq!(batch.messages[0].status, MessageStatus::Plain);
        assert!(batch.failed().all(|m| m.content == PLACEHOLDER_CORRUPTED));

        assert_eq!(h.pipeline.purge_unreadable(&cid()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refused_send_does_not_use_rate_allowance() {
        let config = ClientConfig {
            send_rate_max: 1,
            ..ClientConfig::default()
        };
        let h = broken_key_harness(config);

        for _ in 0..3 {
            assert!(matches!(
                h.pipeline.send(&cid(), &alice(), &[], "hi").await,
                Err(ClientError::EncryptionUnavailable { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_oversized_send_does_not_use_rate_allowance() {
        let config = ClientConfig {
            send_rate_max: 1,
            ..ClientConfig::default()
        };
        let h = harness(config);
        let big = "a".repeat(MAX_MESSAGE_SIZE + 1);

        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], &big).await,
            Err(ClientError::Crypto(CryptoError::MessageTooLarge { .. }))
        ));
        h.pipeline.send(&cid(), &alice(), &[], "fits").await.unwrap();
        assert!(matches!(
            h.pipeline.send(&cid(), &alice(), &[], "again").await,
            Err(ClientError::RateLimited { .. })
        ));
    }
}
