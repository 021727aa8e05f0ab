use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::codec;
use crate::constants::X25519_KEY_SIZE;
use crate::crypto;
use crate::error::IdentityError;

/// A user's X25519 key pair, kept for a future key-exchange step.
/// The symmetric chat flow does not depend on it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserKeyPair {
    /// Base64 of the 32-byte public key.
    pub public_key: String,
    /// Base64 of the 32-byte static secret.
    pub private_key: String,
    pub key_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl UserKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public_key: codec::encode(public.as_bytes()),
            private_key: codec::encode(&secret.to_bytes()),
            key_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    pub fn public_key_bytes(&self) -> Result<[u8; X25519_KEY_SIZE], IdentityError> {
        decode_key(&self.public_key)
    }

    pub fn secret(&self) -> Result<StaticSecret, IdentityError> {
        Ok(StaticSecret::from(decode_key(&self.private_key)?))
    }

    /// True when the stored public key is the one derived from the secret.
    pub fn is_consistent(&self) -> bool {
        match (self.secret(), self.public_key_bytes()) {
            (Ok(secret), Ok(public)) => PublicKey::from(&secret).as_bytes() == &public,
            _ => false,
        }
    }

    /// Fingerprint of the public key, safe to show to the other party.
    pub fn fingerprint(&self) -> Result<String, IdentityError> {
        Ok(crypto::fingerprint(&self.public_key_bytes()?))
    }
}

impl std::fmt::Debug for UserKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

fn decode_key(text: &str) -> Result<[u8; X25519_KEY_SIZE], IdentityError> {
    let bytes = codec::decode(text)?;
    bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)
}
