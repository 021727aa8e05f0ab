//! Storage representation of an encrypted message.
//!
//! Encrypted payloads live in the same text column as plaintext ones and are
//! told apart by a literal prefix:
//!
//! ```text
//! [ENCRYPTED:<conversation id>:<nonce b64>:<ciphertext b64>]
//! ```
//!
//! Base64 never contains `:`, so the two trailing fields are split off from
//! the right and the conversation id may itself contain colons.

use serde::{Deserialize, Serialize};

use crate::constants::{ENCRYPTED_MARKER_PREFIX, ENCRYPTED_MARKER_SUFFIX};
use crate::error::EnvelopeDefect;
use crate::types::ConversationId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub conversation_id: ConversationId,
    /// Base64 of the 12-byte nonce.
    pub nonce: String,
    /// Base64 of ciphertext || 16-byte tag.
    pub ciphertext: String,
}

/// A message payload as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Plain(&'a str),
    Encrypted(Result<EncryptedEnvelope, EnvelopeDefect>),
}

impl EncryptedEnvelope {
    pub fn to_payload(&self) -> String {
        format!(
            "{ENCRYPTED_MARKER_PREFIX}{}:{}:{}{ENCRYPTED_MARKER_SUFFIX}",
            self.conversation_id, self.nonce, self.ciphertext
        )
    }

    /// Parse a marked payload. Callers check [`is_encrypted_payload`] first.
    pub fn from_payload(payload: &str) -> Result<Self, EnvelopeDefect> {
        let body = payload
            .strip_prefix(ENCRYPTED_MARKER_PREFIX)
            .and_then(|rest| rest.strip_suffix(ENCRYPTED_MARKER_SUFFIX))
            .ok_or(EnvelopeDefect::Marker)?;

        let mut fields = body.rsplitn(3, ':');
        let ciphertext = fields.next().ok_or(EnvelopeDefect::Marker)?;
        let nonce = fields.next().ok_or(EnvelopeDefect::Marker)?;
        let conversation_id = fields.next().ok_or(EnvelopeDefect::Marker)?;

        if conversation_id.is_empty() {
            return Err(EnvelopeDefect::Marker);
        }

        Ok(Self {
            conversation_id: ConversationId::new(conversation_id),
            nonce: nonce.to_string(),
            ciphertext: ciphertext.to_string(),
        })
    }
}

pub fn is_encrypted_payload(payload: &str) -> bool {
    payload.starts_with(ENCRYPTED_MARKER_PREFIX)
}

pub fn classify(payload: &str) -> Payload<'_> {
    if is_encrypted_payload(payload) {
        Payload::Encrypted(EncryptedEnvelope::from_payload(payload))
    } else {
        Payload::Plain(payload)
    }
}
