//! Single-call MongoDB helpers
//!
//! This crate wraps the official MongoDB driver in one-shot operations. Each
//! call on [`DocumentStoreClient`] opens its own connection, checks that the
//! primary answers, performs one operation and disconnects.
//!
//! # Features
//! - Nine helpers: `get_one`, `get_many`, `push_one`, `push_many`,
//!   `update_one`, `update_many`, `delete_one`, `delete_many`, `count`
//! - Per-step timeouts for connect, ping, operation and cursor drain
//! - Guaranteed release of every acquired connection
//! - Injectable `tracing` dispatcher instead of a process-wide logger
//! - In-memory backend with acquire/release accounting for tests

pub mod client;
pub mod config;
pub mod connection;
pub mod memory;
pub mod session;

pub use client::DocumentStoreClient;
pub use config::{ClientConfig, Timeouts};
pub use connection::{MongoConnector, MongoCursor, MongoSession};
pub use docstore_common::{Result, Step, StoreError};
pub use memory::{Faults, MemoryConnector};
pub use session::{Connector, DocumentCursor, Namespace, StoreSession};

/// Driver option structs accepted by the helpers
pub use mongodb::options::{
    CountOptions, DeleteOptions, FindOneOptions, FindOptions, InsertManyOptions,
    InsertOneOptions, UpdateOptions,
};
