// SPDX-License-Identifier: MIT OR Apache-2.0

//! The contract between the sync actor and the host application.
//!
//! Secsync is CRDT-agnostic: the host supplies key lookup and the
//! apply/serialize callbacks adapting its CRDT engine. Callbacks may
//! suspend; the sync actor awaits them as part of processing a single event.
use async_trait::async_trait;
use secsync_core::snapshot::SnapshotPublicData;
use secsync_core::{AeadKey, PublicKey};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure of a host callback. Carries no protocol detail; the sync actor
/// records it and decides fatality by call site.
#[derive(Debug, Error)]
#[error("host callback failed: {0}")]
pub struct HostError(pub String);

pub type HostResult<T> = Result<T, HostError>;

/// Everything needed to author a fresh snapshot.
#[derive(Clone, Debug)]
pub struct NewSnapshotData {
    /// Serialized full document state.
    pub data: Vec<u8>,
    /// Fresh snapshot id, normally [`secsync_core::generate_id`].
    pub id: String,
    /// Encryption key for the new snapshot.
    pub key: AeadKey,
    /// Host-defined additional public data fields.
    pub public_data: Map<String, Value>,
}

/// Callbacks the host application provides to a
/// [`DocumentSync`](crate::DocumentSync) actor.
#[async_trait]
pub trait SyncHost: Send + Sync + 'static {
    /// Look up the decryption key for a snapshot (and the updates anchored
    /// to it). `public_data` is `None` when no snapshot is known yet.
    async fn get_snapshot_key(
        &self,
        public_data: Option<&SnapshotPublicData>,
    ) -> HostResult<AeadKey>;

    /// Produce the state, id and key for a snapshot the client is about to
    /// author.
    async fn get_new_snapshot_data(&self) -> HostResult<NewSnapshotData>;

    /// The current key for ephemeral messages. May rotate between calls.
    async fn get_ephemeral_message_key(&self) -> HostResult<AeadKey>;

    /// Replace the local document state with a decrypted snapshot.
    async fn apply_snapshot(&self, content: &[u8]) -> HostResult<()>;

    /// Merge decoded CRDT changes into the local document state.
    async fn apply_changes(&self, changes: Vec<Vec<u8>>) -> HostResult<()>;

    /// Hand a decrypted awareness payload to the application.
    async fn apply_ephemeral_message(&self, content: &[u8], author: &PublicKey) -> HostResult<()>;

    /// Whether messages signed by this key are accepted. Host failures are
    /// treated as `false`.
    async fn is_valid_client(&self, public_key: &PublicKey) -> bool;

    /// Bundle pending CRDT changes into one update payload.
    fn serialize_changes(&self, changes: &[Vec<u8>]) -> HostResult<Vec<u8>>;

    /// Split an update payload back into CRDT changes.
    fn deserialize_changes(&self, content: &[u8]) -> HostResult<Vec<Vec<u8>>>;

    /// Whether this client authors the first snapshot when the server has
    /// none for the document.
    fn should_create_initial_snapshot(&self) -> bool {
        false
    }

    /// Called for wire messages with a `type` outside the protocol.
    async fn handle_custom_message(&self, _message: Value) -> HostResult<()> {
        Ok(())
    }
}
