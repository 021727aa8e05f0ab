/// AES-256-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// X25519 key size in bytes
pub const X25519_KEY_SIZE: usize = 32;

/// Number of hex characters kept from a SHA-256 key fingerprint
pub const FINGERPRINT_HEX_LEN: usize = 16;

/// Literal prefix that marks an encrypted message payload
pub const ENCRYPTED_MARKER_PREFIX: &str = "[ENCRYPTED:";

/// Literal suffix closing an encrypted message payload
pub const ENCRYPTED_MARKER_SUFFIX: &str = "]";

/// Known plaintext used by the key self-test
pub const SELF_TEST_PLAINTEXT: &str = "parley-key-self-test";

/// Maximum plaintext message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;
