// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot and update persistence.
//!
//! The server never holds a decryption key; it stores opaque envelopes and
//! enforces only the structural rules that keep clients consistent: the
//! snapshot chain must extend the active snapshot, recorded update clocks
//! must cover everything the server accepted, and per-author update clocks
//! must increase without gaps. All acceptance decisions for one document are
//! serialized, so clients observe them as atomic.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secsync_core::snapshot::{Snapshot, SnapshotServerData};
use secsync_core::update::{Update, UpdateServerData};
use secsync_core::DocumentFrame;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Result of trying to persist a snapshot.
#[derive(Clone, Debug)]
pub enum SnapshotSaveOutcome {
    /// Accepted; the returned envelope carries server data for broadcast.
    Saved { snapshot: Snapshot },
    /// The snapshot does not extend the active one; the author is behind
    /// and receives the active snapshot plus its updates to catch up.
    OutdatedSnapshot {
        snapshot: Snapshot,
        updates: Vec<Update>,
    },
    /// The snapshot's recorded clocks miss updates the server already
    /// accepted; the author receives exactly those updates.
    MissedUpdates { updates: Vec<Update> },
}

/// Result of trying to persist an update.
#[derive(Clone, Debug)]
pub enum UpdateSaveOutcome {
    /// Accepted; the returned envelope carries the assigned version.
    Saved { update: Update, version: u64 },
    /// Rejected: wrong snapshot reference or non-successor clock.
    Rejected { snapshot_id: String, clock: u64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} does not exist")]
    DocumentNotFound(String),

    #[error("storage failed: {0}")]
    Internal(String),
}

/// Persistence seam of the server. Implementations must serialize snapshot
/// and update acceptance per document.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// The initial payload for a fresh subscription, `None` when the
    /// document does not exist.
    async fn load_document(&self, doc_id: &str) -> Result<Option<DocumentFrame>, StoreError>;

    /// Create an empty document (lenient mode).
    async fn create_document(&self, doc_id: &str) -> Result<(), StoreError>;

    async fn save_snapshot(
        &self,
        doc_id: &str,
        snapshot: Snapshot,
    ) -> Result<SnapshotSaveOutcome, StoreError>;

    async fn save_update(
        &self,
        doc_id: &str,
        update: Update,
    ) -> Result<UpdateSaveOutcome, StoreError>;
}

#[derive(Debug, Default)]
struct DocumentRecord {
    active_snapshot: Option<Snapshot>,
    /// Updates anchored to the active snapshot, in version order, server
    /// data attached.
    updates: Vec<Update>,
    /// Last accepted clock per author (base64url public key).
    update_clocks: HashMap<String, u64>,
    /// Version assigned to the most recent update; resets with every
    /// snapshot.
    latest_version: u64,
}

/// In-memory [`DocumentStore`], one lock per document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Arc<Mutex<DocumentRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn document(&self, doc_id: &str) -> Option<Arc<Mutex<DocumentRecord>>> {
        self.documents.read().await.get(doc_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_document(&self, doc_id: &str) -> Result<Option<DocumentFrame>, StoreError> {
        let Some(record) = self.document(doc_id).await else {
            return Ok(None);
        };
        let record = record.lock().await;

        let snapshot = record.active_snapshot.clone().map(|mut snapshot| {
            snapshot.server_data = Some(SnapshotServerData {
                latest_version: record.latest_version,
            });
            snapshot
        });

        Ok(Some(DocumentFrame {
            doc_id: doc_id.to_string(),
            snapshot,
            updates: record.updates.clone(),
        }))
    }

    async fn create_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        documents
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentRecord::default())));
        Ok(())
    }

    async fn save_snapshot(
        &self,
        doc_id: &str,
        mut snapshot: Snapshot,
    ) -> Result<SnapshotSaveOutcome, StoreError> {
        let record = self
            .document(doc_id)
            .await
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        let mut record = record.lock().await;

        if let Some(active) = &record.active_snapshot {
            // The chain must extend the currently active snapshot.
            if snapshot.public_data.parent_snapshot_id != active.public_data.snapshot_id {
                let mut active = active.clone();
                active.server_data = Some(SnapshotServerData {
                    latest_version: record.latest_version,
                });
                return Ok(SnapshotSaveOutcome::OutdatedSnapshot {
                    snapshot: active,
                    updates: record.updates.clone(),
                });
            }

            // Every author clock the server accepted must be covered.
            let behind = record.update_clocks.iter().any(|(author, server_clock)| {
                match snapshot.public_data.parent_snapshot_update_clocks.get(author) {
                    Some(recorded) => recorded < server_clock,
                    None => true,
                }
            });
            if behind {
                let missing = record
                    .updates
                    .iter()
                    .filter(|update| {
                        let author = update.public_data.pub_key.to_base64();
                        match snapshot.public_data.parent_snapshot_update_clocks.get(&author) {
                            Some(recorded) => update.public_data.clock > *recorded,
                            None => true,
                        }
                    })
                    .cloned()
                    .collect();
                return Ok(SnapshotSaveOutcome::MissedUpdates { updates: missing });
            }
        }

        snapshot.server_data = Some(SnapshotServerData { latest_version: 0 });
        record.active_snapshot = Some(snapshot.clone());
        record.updates.clear();
        record.update_clocks.clear();
        record.latest_version = 0;

        Ok(SnapshotSaveOutcome::Saved { snapshot })
    }

    async fn save_update(
        &self,
        doc_id: &str,
        mut update: Update,
    ) -> Result<UpdateSaveOutcome, StoreError> {
        let record = self
            .document(doc_id)
            .await
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        let mut record = record.lock().await;

        let rejected = UpdateSaveOutcome::Rejected {
            snapshot_id: update.public_data.ref_snapshot_id.clone(),
            clock: update.public_data.clock,
        };

        let Some(active) = &record.active_snapshot else {
            return Ok(rejected);
        };
        if update.public_data.ref_snapshot_id != active.public_data.snapshot_id {
            return Ok(rejected);
        }

        let author = update.public_data.pub_key.to_base64();
        let expected = record
            .update_clocks
            .get(&author)
            .map(|clock| clock + 1)
            .unwrap_or(0);

        if update.public_data.clock < expected {
            // A client resent an already accepted update. Acknowledge it
            // again when it is byte-identical, reject a conflicting one.
            let stored = record.updates.iter().find(|stored| {
                stored.public_data.pub_key == update.public_data.pub_key
                    && stored.public_data.clock == update.public_data.clock
            });
            return Ok(match stored {
                Some(stored) if stored.ciphertext == update.ciphertext => {
                    UpdateSaveOutcome::Saved {
                        update: stored.clone(),
                        version: stored
                            .server_data
                            .map(|server_data| server_data.version)
                            .unwrap_or_default(),
                    }
                }
                _ => rejected,
            });
        }

        if update.public_data.clock != expected {
            return Ok(rejected);
        }

        let version = record.latest_version + 1;
        record.latest_version = version;
        update.server_data = Some(UpdateServerData { version });
        record.updates.push(update.clone());
        record.update_clocks.insert(author, update.public_data.clock);

        Ok(UpdateSaveOutcome::Saved { update, version })
    }
}
