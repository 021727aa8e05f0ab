use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Invalid base64 length after repair: {0} symbols")]
    InvalidLength(usize),

    #[error("Invalid base64: {0}")]
    Invalid(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// Why an envelope was rejected before (or after) the AEAD operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeDefect {
    /// Payload starts with the marker but does not split into its fields.
    Marker,
    NonceEncoding,
    NonceLength(usize),
    CiphertextEncoding,
    CiphertextTooShort(usize),
    /// Authenticated plaintext was not valid UTF-8.
    Utf8,
}

impl std::fmt::Display for EnvelopeDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marker => write!(f, "payload marker is incomplete"),
            Self::NonceEncoding => write!(f, "nonce is not valid base64"),
            Self::NonceLength(n) => write!(f, "nonce is {n} bytes, expected 12"),
            Self::CiphertextEncoding => write!(f, "ciphertext is not valid base64"),
            Self::CiphertextTooShort(n) => {
                write!(f, "ciphertext is {n} bytes, shorter than the 16-byte tag")
            }
            Self::Utf8 => write!(f, "decrypted payload is not UTF-8"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(EnvelopeDefect),

    #[error(
        "Authentication failed: this key cannot decrypt this message; \
         it may be stale or the message used a different key"
    )]
    AuthenticationFailure,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Key encoding error: {0}")]
    Encoding(#[from] EncodingError),
}
