//! Structured diagnostic events for the UI layer.
//!
//! Events are fanned out over a broadcast channel. Nobody listening is the
//! normal state for headless use and is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

use parley_shared::ConversationId;

use crate::pipeline::{BatchHealth, RecoveryAction};

pub const EVENT_BATCH_DEGRADED: &str = "batch-degraded";
pub const EVENT_PLAINTEXT_FALLBACK: &str = "plaintext-fallback";
pub const EVENT_KEY_REGENERATED: &str = "key-regenerated";
pub const EVENT_KEY_NOT_PERSISTED: &str = "key-not-persisted";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DiagnosticEvent {
    /// One aggregate event per fetched batch that had undecryptable rows.
    BatchDegraded {
        conversation_id: ConversationId,
        health: BatchHealth,
        action: RecoveryAction,
    },
    /// A message was stored unencrypted because encryption was unavailable.
    PlaintextFallback {
        conversation_id: ConversationId,
        reason: String,
    },
    KeyRegenerated {
        conversation_id: ConversationId,
        previous_fingerprint: Option<String>,
        fingerprint: String,
    },
    /// The key is usable this session but was not written to durable storage.
    KeyNotPersisted { conversation_id: ConversationId },
}

impl DiagnosticEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BatchDegraded { .. } => EVENT_BATCH_DEGRADED,
            Self::PlaintextFallback { .. } => EVENT_PLAINTEXT_FALLBACK,
            Self::KeyRegenerated { .. } => EVENT_KEY_REGENERATED,
            Self::KeyNotPersisted { .. } => EVENT_KEY_NOT_PERSISTED,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No diagnostic listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
