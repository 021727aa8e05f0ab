use thiserror::Error;

use parley_shared::error::{CryptoError, IdentityError};
use parley_shared::ConversationId;
use parley_store::StoreError;

#[derive(Error, Debug)]
pub enum ClientError {
    /// No key exists for the conversation; recoverable with `ensure_key`.
    #[error("No key for conversation {0}")]
    KeyNotFound(ConversationId),

    /// A key record exists but is unusable; only regeneration recovers it.
    #[error("Key for conversation {conversation_id} is corrupt: {reason}")]
    KeyCorrupt {
        conversation_id: ConversationId,
        reason: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Encryption failed and plaintext fallback is disabled; nothing was sent.
    #[error("Encryption unavailable, message not sent: {reason}")]
    EncryptionUnavailable { reason: String },

    #[error("Message is empty")]
    EmptyMessage,
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
