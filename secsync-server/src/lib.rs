// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay server for secsync documents.
//!
//! The server stores encrypted snapshots and updates without ever holding a
//! decryption key. Its job is ordering, not content: it enforces the
//! snapshot chain, validates per-author update clocks inside a serialized
//! per-document acceptance path, acknowledges authors and fans accepted
//! artifacts out to every other subscribed connection. Ephemeral messages
//! are relayed and never persisted.
pub mod connection;
pub mod registry;
pub mod server;
pub mod store;

pub use connection::DocumentConnection;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{ServerConfig, ServerError, SyncServer};
pub use store::{
    DocumentStore, MemoryStore, SnapshotSaveOutcome, StoreError, UpdateSaveOutcome,
};
