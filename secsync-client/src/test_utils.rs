// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory host used across the test suites.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use secsync_core::snapshot::SnapshotPublicData;
use secsync_core::test_utils::test_key;
use secsync_core::{generate_id, AeadKey, PublicKey};
use serde_json::{Map, Value};

use crate::host::{HostError, HostResult, NewSnapshotData, SyncHost};

/// Host adapter that records every callback instead of driving a CRDT.
pub struct MemoryHost {
    pub key: AeadKey,
    pub snapshot_data: Mutex<Vec<u8>>,
    pub applied_snapshots: Mutex<Vec<Vec<u8>>>,
    pub applied_changes: Mutex<Vec<Vec<u8>>>,
    pub applied_ephemeral: Mutex<Vec<(Vec<u8>, PublicKey)>>,
    pub custom_messages: Mutex<Vec<Value>>,
    pub create_initial_snapshot: bool,
    /// Flip at any point to make `is_valid_client` reject every author.
    pub reject_clients: AtomicBool,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            key: test_key(),
            snapshot_data: Mutex::new(b"document state".to_vec()),
            applied_snapshots: Mutex::new(Vec::new()),
            applied_changes: Mutex::new(Vec::new()),
            applied_ephemeral: Mutex::new(Vec::new()),
            custom_messages: Mutex::new(Vec::new()),
            create_initial_snapshot: false,
            reject_clients: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SyncHost for MemoryHost {
    async fn get_snapshot_key(
        &self,
        _public_data: Option<&SnapshotPublicData>,
    ) -> HostResult<AeadKey> {
        Ok(self.key)
    }

    async fn get_new_snapshot_data(&self) -> HostResult<NewSnapshotData> {
        Ok(NewSnapshotData {
            data: self.snapshot_data.lock().unwrap().clone(),
            id: generate_id(),
            key: self.key,
            public_data: Map::new(),
        })
    }

    async fn get_ephemeral_message_key(&self) -> HostResult<AeadKey> {
        Ok(self.key)
    }

    async fn apply_snapshot(&self, content: &[u8]) -> HostResult<()> {
        self.applied_snapshots.lock().unwrap().push(content.to_vec());
        Ok(())
    }

    async fn apply_changes(&self, changes: Vec<Vec<u8>>) -> HostResult<()> {
        self.applied_changes.lock().unwrap().extend(changes);
        Ok(())
    }

    async fn apply_ephemeral_message(&self, content: &[u8], author: &PublicKey) -> HostResult<()> {
        self.applied_ephemeral
            .lock()
            .unwrap()
            .push((content.to_vec(), *author));
        Ok(())
    }

    async fn is_valid_client(&self, _public_key: &PublicKey) -> bool {
        !self.reject_clients.load(Ordering::SeqCst)
    }

    fn serialize_changes(&self, changes: &[Vec<u8>]) -> HostResult<Vec<u8>> {
        serde_json::to_vec(changes).map_err(|err| HostError(err.to_string()))
    }

    fn deserialize_changes(&self, content: &[u8]) -> HostResult<Vec<Vec<u8>>> {
        serde_json::from_slice(content).map_err(|err| HostError(err.to_string()))
    }

    fn should_create_initial_snapshot(&self) -> bool {
        self.create_initial_snapshot
    }

    async fn handle_custom_message(&self, message: Value) -> HostResult<()> {
        self.custom_messages.lock().unwrap().push(message);
        Ok(())
    }
}
