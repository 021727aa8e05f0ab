//! # parley-client
//!
//! Conversation-key encryption service: the per-conversation [`KeyStore`],
//! the [`KeyManager`] lifecycle on top of it and the [`ChatPipeline`] that
//! encrypts on send and decrypts (or explains why it cannot) on fetch.
//!
//! Everything is an explicit object built once by the caller and shared via
//! `Arc`; see [`Client::open`] for the usual wiring.

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod key_store;
pub mod lifecycle;
pub mod pipeline;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use parley_shared::ConversationId;
use parley_store::{Database, LocalStore};

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{DiagnosticEvent, EventBus};
pub use identity::UserKeys;
pub use key_store::{KeyPresence, KeyStore, Persistence};
pub use lifecycle::{KeyHealth, KeyManager, Regeneration};
pub use pipeline::{
    BatchHealth, ChatPipeline, ConversationReset, ConversationWatch, DecodedMessage,
    DecryptedBatch, FailureKind, MessageStatus, RecoveryAction, SendMode, SendReceipt,
};

const DEFAULT_LOG_FILTER: &str = "parley_client=debug,parley_store=info,warn";

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// A conversation that has a stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub messages: u64,
    pub health: KeyHealth,
}

/// The service graph over one SQLite database.
pub struct Client {
    pub store: Arc<LocalStore>,
    pub events: EventBus,
    pub keys: Arc<KeyManager>,
    pub pipeline: ChatPipeline,
    pub user_keys: UserKeys,
}

impl Client {
    /// Open the configured database (or the platform default) and wire the
    /// services together.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let db = match &config.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let store =
            LocalStore::new(db)?.with_poll_interval(Duration::from_millis(config.feed_poll_ms));
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<LocalStore>, config: &ClientConfig) -> Self {
        let events = EventBus::new();
        let key_store = Arc::new(KeyStore::new(store.clone(), events.clone()));
        let keys = Arc::new(KeyManager::new(key_store, events.clone()));
        let pipeline = ChatPipeline::new(keys.clone(), store.clone(), events.clone(), config);

        tracing::debug!(path = ?store.with_db(|db| Ok(db.path())).ok().flatten(), "Client ready");

        Self {
            user_keys: UserKeys::new(store.clone()),
            store,
            events,
            keys,
            pipeline,
        }
    }

    /// Every conversation with a key record, with its message count and key
    /// health.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        let counted = self.store.with_db(|db| {
            db.list_key_conversations()?
                .into_iter()
                .map(|id| Ok((db.count_messages(&id)?, id)))
                .collect::<parley_store::Result<Vec<_>>>()
        })?;

        let mut summaries = Vec::with_capacity(counted.len());
        for (messages, conversation_id) in counted {
            let health = self.keys.health(&conversation_id).await;
            summaries.push(ConversationSummary {
                conversation_id,
                messages,
                health,
            });
        }
        Ok(summaries)
    }
}
