use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec;
use crate::constants::{
    FINGERPRINT_HEX_LEN, MAX_MESSAGE_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use crate::envelope::EncryptedEnvelope;
use crate::error::{CryptoError, DecryptionError, EnvelopeDefect};
use crate::types::ConversationId;

/// A conversation's 256-bit AES-GCM key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SYMMETRIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Raw key bytes, for persistence and fingerprinting only.
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        codec::encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = codec::decode(text)?;
        Self::from_bytes(&bytes)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SymmetricKey").field(&"[REDACTED]").finish()
    }
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal `plaintext` under `key` with a fresh nonce. No associated data is
/// used; the conversation id in the envelope is checked by the reader.
pub fn encrypt(
    key: &SymmetricKey,
    conversation_id: &ConversationId,
    plaintext: &str,
) -> Result<EncryptedEnvelope, CryptoError> {
    if plaintext.len() > MAX_MESSAGE_SIZE {
        return Err(CryptoError::MessageTooLarge {
            size: plaintext.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(EncryptedEnvelope {
        conversation_id: conversation_id.clone(),
        nonce: codec::encode(&nonce_bytes),
        ciphertext: codec::encode(&ciphertext),
    })
}

pub fn decrypt(envelope: &EncryptedEnvelope, key: &SymmetricKey) -> Result<String, DecryptionError> {
    let nonce_bytes = codec::decode(&envelope.nonce)
        .map_err(|_| DecryptionError::MalformedEnvelope(EnvelopeDefect::NonceEncoding))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(DecryptionError::MalformedEnvelope(EnvelopeDefect::NonceLength(
            nonce_bytes.len(),
        )));
    }

    let ciphertext = codec::decode(&envelope.ciphertext)
        .map_err(|_| DecryptionError::MalformedEnvelope(EnvelopeDefect::CiphertextEncoding))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(DecryptionError::MalformedEnvelope(
            EnvelopeDefect::CiphertextTooShort(ciphertext.len()),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| DecryptionError::AuthenticationFailure)?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::MalformedEnvelope(EnvelopeDefect::Utf8))
}

/// Short SHA-256 fingerprint (lowercase hex) for out-of-band comparison.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}
