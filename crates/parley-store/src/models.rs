//! Domain model structs persisted in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

// ---------------------------------------------------------------------------
// MessageRow
// ---------------------------------------------------------------------------

/// A stored chat message. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    /// Unique message identifier.
    pub id: Uuid,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Plaintext, or a `[ENCRYPTED:...]` envelope.
    pub payload: String,
    /// When the message was written.
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    /// Build a new row stamped with a fresh id and the current time.
    pub fn new(conversation_id: ConversationId, sender_id: UserId, payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Whether the payload carries the encrypted-envelope marker.
    pub fn is_encrypted(&self) -> bool {
        parley_shared::envelope::is_encrypted_payload(&self.payload)
    }
}
