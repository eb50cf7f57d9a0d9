// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection synchronization context.
//!
//! Owned exclusively by the sync actor. A reconnect resets everything here;
//! the host's CRDT state lives outside and survives.
use std::collections::{HashMap, VecDeque};

use secsync_core::ephemeral::EphemeralSession;
use secsync_core::snapshot::{Snapshot, SnapshotPublicData};
use secsync_core::update::Update;
use serde_json::Value;

/// Capacity of the ephemeral error ring buffers.
pub const ERROR_BUFFER_CAPACITY: usize = 20;

/// Bounded ring buffer of error descriptions; the oldest entry is evicted
/// once the capacity is reached.
#[derive(Clone, Debug, Default)]
pub struct ErrorBuffer {
    entries: VecDeque<String>,
}

impl ErrorBuffer {
    pub fn push(&mut self, error: impl Into<String>) {
        if self.entries.len() == ERROR_BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(error.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.entries.iter()
    }
}

/// How much of the initial `document` payload could be decrypted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DocumentDecryptionState {
    #[default]
    Pending,
    /// The snapshot applied but an update failed; everything before the
    /// failure is in effect.
    Partial,
    Complete,
    Failed,
}

/// What the client tracks per known snapshot: chain material for parent
/// proofs and the per-author update clocks observed against it. Clock values
/// are the last applied clock, `-1` sentinel-free: an author without an
/// entry has had no update applied.
#[derive(Clone, Debug)]
pub struct SnapshotInfoWithUpdateClocks {
    pub snapshot_id: String,
    pub ciphertext: String,
    pub parent_snapshot_proof: String,
    /// Public data of the snapshot when known; lets the host derive keys.
    pub public_data: Option<SnapshotPublicData>,
    /// Last applied clock per author (base64url public key).
    pub update_clocks: HashMap<String, u64>,
}

/// An update sent but not yet confirmed by the server.
#[derive(Clone, Debug)]
pub struct UpdateInFlight {
    pub clock: u64,
    pub update: Update,
    /// The raw changes bundled into this update, kept so they can be
    /// re-anchored when the active snapshot changes underneath us.
    pub changes: Vec<Vec<u8>>,
}

/// A snapshot sent but not yet confirmed by the server.
#[derive(Clone, Debug)]
pub struct SnapshotInFlight {
    pub snapshot: Snapshot,
}

/// The sync actor's per-connection state.
#[derive(Debug, Default)]
pub struct SyncContext {
    pub active_snapshot_id: Option<String>,
    pub latest_server_version: Option<u64>,
    pub document_decryption_state: DocumentDecryptionState,
    pub incoming_queue: VecDeque<secsync_core::Frame>,
    pub custom_message_queue: VecDeque<Value>,
    pub pending_changes_queue: Vec<Vec<u8>>,
    pub snapshot_in_flight: Option<SnapshotInFlight>,
    pub updates_in_flight: Vec<UpdateInFlight>,
    pub snapshot_infos_with_update_clocks: Vec<SnapshotInfoWithUpdateClocks>,
    /// Clock of the last update this client sent; `-1` before the first.
    pub updates_local_clock: i64,
    pub ephemeral_session: EphemeralSession,
    pub ephemeral_receiving_errors: ErrorBuffer,
    pub ephemeral_authoring_errors: ErrorBuffer,
    /// Last fatal or protocol error, kept for observability.
    pub last_error: Option<String>,
    pub unsuccessful_reconnects: u32,
}

impl SyncContext {
    pub fn new() -> Self {
        Self {
            updates_local_clock: -1,
            ephemeral_session: EphemeralSession::new(),
            ..Default::default()
        }
    }

    /// Reset everything bound to one connection. The reconnect counter
    /// survives so backoff keeps growing across failed attempts.
    pub fn reset(&mut self) {
        let unsuccessful_reconnects = self.unsuccessful_reconnects;
        *self = Self::new();
        self.unsuccessful_reconnects = unsuccessful_reconnects;
    }

    /// Chain and clock info of the currently active snapshot.
    pub fn active_snapshot_info(&self) -> Option<&SnapshotInfoWithUpdateClocks> {
        let active = self.active_snapshot_id.as_deref()?;
        self.snapshot_infos_with_update_clocks
            .iter()
            .find(|info| info.snapshot_id == active)
    }

    pub fn active_snapshot_info_mut(&mut self) -> Option<&mut SnapshotInfoWithUpdateClocks> {
        let active = self.active_snapshot_id.clone()?;
        self.snapshot_infos_with_update_clocks
            .iter_mut()
            .find(|info| info.snapshot_id == active)
    }
}
