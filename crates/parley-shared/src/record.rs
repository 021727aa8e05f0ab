//! Persisted form of a conversation key.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SymmetricKey;
use crate::error::CryptoError;
use crate::types::{ConversationId, UserId};

/// `{ "key", "conversationId", "participants", "timestamp" }` as stored in
/// the durable key vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    /// Base64 of the raw 32-byte key.
    #[serde(rename = "key")]
    pub encoded_key: String,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// Creation time, milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub created_at_ms: i64,
}

impl KeyRecord {
    pub fn new(conversation_id: &ConversationId, key: &SymmetricKey, participants: &[UserId]) -> Self {
        Self {
            encoded_key: key.to_base64(),
            conversation_id: conversation_id.clone(),
            participants: participants.to_vec(),
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Decode and length-check the stored key.
    pub fn key(&self) -> Result<SymmetricKey, CryptoError> {
        SymmetricKey::from_base64(&self.encoded_key)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at_ms).single()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
