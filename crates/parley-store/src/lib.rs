//! # parley-store
//!
//! Local durable storage for Parley, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle with typed CRUD helpers,
//! the two storage seams the client service is written against
//! ([`KeyVault`] for opaque key records, [`MessageStore`] for message rows and
//! their change feed), a SQLite-backed [`LocalStore`] implementing both, and
//! an in-process [`MemoryStore`] with the same behaviour.

pub mod backend;
pub mod database;
pub mod keys;
pub mod local;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod user_keys;

mod error;

pub use backend::{KeyVault, MessageStore};
pub use database::Database;
pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use models::*;
