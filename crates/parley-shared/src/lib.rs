//! # parley-shared
//!
//! Building blocks shared by the store, the client service and the CLI:
//! base64 codec, conversation keys and the AES-256-GCM message cipher, the
//! `[ENCRYPTED:...]` payload envelope, persisted key records, user key pairs
//! and the error taxonomy.

pub mod codec;
pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod record;
pub mod types;

pub use crypto::SymmetricKey;
pub use envelope::EncryptedEnvelope;
pub use record::KeyRecord;
pub use types::{ConversationId, UserId};
