//! Per-user X25519 key pairs.
//!
//! Not used by the symmetric chat flow. Kept so a later key-exchange step has
//! a stable, persisted identity key to build on.

use std::sync::Arc;

use tracing::{info, warn};

use parley_shared::identity::UserKeyPair;
use parley_shared::UserId;
use parley_store::{LocalStore, StoreError};

use crate::error::{ClientError, Result};

pub struct UserKeys {
    store: Arc<LocalStore>,
}

impl UserKeys {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// The user's active key pair, `None` if none has been created.
    pub fn load(&self, user_id: &UserId) -> Result<Option<UserKeyPair>> {
        Ok(self.store.with_db(|db| db.get_user_keys(user_id))?)
    }

    /// Load the active key pair, creating one if absent or unusable.
    pub fn initialize(&self, user_id: &UserId) -> Result<UserKeyPair> {
        match self.load(user_id) {
            Ok(Some(pair)) if pair.is_consistent() => return Ok(pair),
            Ok(Some(_)) => warn!(user = %user_id, "Stored key pair is inconsistent, replacing"),
            Ok(None) => {}
            Err(ClientError::Store(StoreError::Serialization(e))) => {
                warn!(user = %user_id, error = %e, "Stored key pair is unreadable, replacing")
            }
            Err(e) => return Err(e),
        }

        self.rotate(user_id)
    }

    /// Replace the user's key pair unconditionally.
    pub fn rotate(&self, user_id: &UserId) -> Result<UserKeyPair> {
        let pair = UserKeyPair::generate();
        self.store.with_db(|db| db.store_user_keys(user_id, &pair))?;
        info!(user = %user_id, key_id = %pair.key_id, "Generated user key pair");
        Ok(pair)
    }

    pub fn fingerprint(&self, user_id: &UserId) -> Result<Option<String>> {
        match self.load(user_id)? {
            Some(pair) => Ok(Some(pair.fingerprint()?)),
            None => Ok(None),
        }
    }
}
