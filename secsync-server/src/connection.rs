// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection frame handling.
//!
//! One [`DocumentConnection`] exists per subscribed client. It validates and
//! persists incoming envelopes through the store, acknowledges the author
//! and fans accepted artifacts out to every other connection on the
//! document. Ephemeral messages are relayed without ever touching storage.
use std::sync::Arc;

use secsync_core::ephemeral::EphemeralMessage;
use secsync_core::snapshot::Snapshot;
use secsync_core::update::Update;
use secsync_core::{
    Frame, SnapshotFrame, SnapshotSaveFailedFrame, SnapshotSavedFrame, UpdateSaveFailedFrame,
    UpdateSavedFrame,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{DocumentStore, SnapshotSaveOutcome, UpdateSaveOutcome};

pub struct DocumentConnection<S: DocumentStore> {
    doc_id: String,
    connection_id: ConnectionId,
    store: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    outgoing: mpsc::Sender<Frame>,
}

impl<S: DocumentStore> DocumentConnection<S> {
    pub fn new(
        doc_id: impl Into<String>,
        connection_id: ConnectionId,
        store: Arc<S>,
        registry: Arc<ConnectionRegistry>,
        outgoing: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            connection_id,
            store,
            registry,
            outgoing,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Handle one frame received from this client.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Snapshot(SnapshotFrame { snapshot }) => self.handle_snapshot(snapshot).await,
            Frame::Update(update) => self.handle_update(update).await,
            Frame::EphemeralMessage(message) => self.handle_ephemeral(message).await,
            other => {
                trace!(?other, "ignoring unexpected client frame");
            }
        }
    }

    async fn handle_snapshot(&self, snapshot: Snapshot) {
        if snapshot.public_data.doc_id != self.doc_id {
            warn!(
                doc_id = %self.doc_id,
                "snapshot for wrong document on this connection"
            );
            self.reply(Frame::SnapshotSaveFailed(SnapshotSaveFailedFrame {
                doc_id: self.doc_id.clone(),
                snapshot: None,
                updates: None,
            }))
            .await;
            return;
        }

        let snapshot_id = snapshot.public_data.snapshot_id.clone();
        match self.store.save_snapshot(&self.doc_id, snapshot).await {
            Ok(SnapshotSaveOutcome::Saved { snapshot }) => {
                debug!(doc_id = %self.doc_id, %snapshot_id, "snapshot accepted");
                self.reply(Frame::SnapshotSaved(SnapshotSavedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot_id,
                }))
                .await;
                self.registry
                    .broadcast(
                        &self.doc_id,
                        Some(self.connection_id),
                        Frame::Snapshot(SnapshotFrame { snapshot }),
                    )
                    .await;
            }
            Ok(SnapshotSaveOutcome::OutdatedSnapshot { snapshot, updates }) => {
                debug!(doc_id = %self.doc_id, %snapshot_id, "snapshot outdated");
                self.reply(Frame::SnapshotSaveFailed(SnapshotSaveFailedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot: Some(snapshot),
                    updates: Some(updates),
                }))
                .await;
            }
            Ok(SnapshotSaveOutcome::MissedUpdates { updates }) => {
                debug!(doc_id = %self.doc_id, %snapshot_id, "snapshot missed updates");
                self.reply(Frame::SnapshotSaveFailed(SnapshotSaveFailedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot: None,
                    updates: Some(updates),
                }))
                .await;
            }
            Err(err) => {
                warn!(doc_id = %self.doc_id, "snapshot save failed: {err}");
                self.reply(Frame::SnapshotSaveFailed(SnapshotSaveFailedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot: None,
                    updates: None,
                }))
                .await;
            }
        }
    }

    async fn handle_update(&self, update: Update) {
        if update.public_data.doc_id != self.doc_id {
            self.reply(Frame::UpdateSaveFailed(UpdateSaveFailedFrame {
                doc_id: self.doc_id.clone(),
                snapshot_id: update.public_data.ref_snapshot_id,
                clock: update.public_data.clock,
            }))
            .await;
            return;
        }

        let ref_snapshot_id = update.public_data.ref_snapshot_id.clone();
        let clock = update.public_data.clock;

        match self.store.save_update(&self.doc_id, update).await {
            Ok(UpdateSaveOutcome::Saved { update, version }) => {
                self.reply(Frame::UpdateSaved(UpdateSavedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot_id: update.public_data.ref_snapshot_id.clone(),
                    clock: update.public_data.clock,
                    server_version: version,
                }))
                .await;
                self.registry
                    .broadcast(
                        &self.doc_id,
                        Some(self.connection_id),
                        Frame::Update(update),
                    )
                    .await;
            }
            Ok(UpdateSaveOutcome::Rejected { snapshot_id, clock }) => {
                debug!(doc_id = %self.doc_id, clock, "update rejected");
                self.reply(Frame::UpdateSaveFailed(UpdateSaveFailedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot_id,
                    clock,
                }))
                .await;
            }
            Err(err) => {
                // Storage failures still have to resolve the author's
                // in-flight entry so the resend path can fire.
                warn!(doc_id = %self.doc_id, "update save failed: {err}");
                self.reply(Frame::UpdateSaveFailed(UpdateSaveFailedFrame {
                    doc_id: self.doc_id.clone(),
                    snapshot_id: ref_snapshot_id,
                    clock,
                }))
                .await;
            }
        }
    }

    /// Ephemeral messages are relayed, never validated beyond the document
    /// id and never persisted.
    async fn handle_ephemeral(&self, message: EphemeralMessage) {
        if message.public_data.doc_id != self.doc_id {
            trace!(doc_id = %self.doc_id, "dropping ephemeral message for wrong document");
            return;
        }
        self.registry
            .broadcast(
                &self.doc_id,
                Some(self.connection_id),
                Frame::EphemeralMessage(message),
            )
            .await;
    }

    async fn reply(&self, frame: Frame) {
        let _ = self.outgoing.send(frame).await;
    }
}
