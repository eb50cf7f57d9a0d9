// SPDX-License-Identifier: MIT OR Apache-2.0

//! The document sync actor.
//!
//! One actor owns one document's synchronization context. It drains a single
//! event queue FIFO; every event is processed to completion (including any
//! awaited host callbacks) before the next one is looked at, so the context
//! is never observed mid-transition. The websocket transport is a separate
//! actor that only holds a sender into this queue.
use std::collections::BTreeMap;
use std::sync::Arc;

use secsync_core::ephemeral::{
    create_ephemeral_message, verify_and_decrypt_ephemeral_message, EphemeralMessageType,
};
use secsync_core::snapshot::{
    create_snapshot, verify_and_decrypt_snapshot, ParentSnapshotInfo, Snapshot, SnapshotPublicData,
};
use secsync_core::update::{
    create_update, verify_and_decrypt_update, Update, UpdateOutcome, UpdatePublicData,
};
use secsync_core::{
    AeadKey, DocumentFrame, Frame, SecsyncError, SnapshotFrame, SnapshotSaveFailedFrame,
    SnapshotSavedFrame, UpdateSaveFailedFrame, UpdateSavedFrame,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::SyncConfig;
use crate::context::{
    DocumentDecryptionState, SnapshotInFlight, SnapshotInfoWithUpdateClocks, SyncContext,
    UpdateInFlight,
};
use crate::host::{HostError, SyncHost};
use crate::transport::TransportCommand;

/// Connection life-cycle states of the sync actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting { retrying: bool },
    Connected,
    /// Terminal. The host decides whether to discard the document.
    Failed,
}

/// Event inputs from the transport actor and the host.
#[derive(Debug)]
pub enum SyncEvent {
    WebsocketConnected,
    WebsocketDisconnected,
    WebsocketRetry,
    AddToIncomingQueue(Frame),
    AddToCustomMessageQueue(Value),
    AddChanges(Vec<Vec<u8>>),
    CreateSnapshot,
    Disconnect,
    FailedCreatingEphemeralUpdate(String),
    SendEphemeralUpdate {
        data: Vec<u8>,
        message_type: EphemeralMessageType,
    },
}

#[derive(Debug, Error)]
enum ProcessError {
    #[error(transparent)]
    Protocol(#[from] SecsyncError),

    #[error("author was rejected by the host")]
    InvalidClient,

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Send handle for host applications.
#[derive(Clone, Debug)]
pub struct DocumentSyncHandle {
    event_tx: mpsc::Sender<SyncEvent>,
}

impl DocumentSyncHandle {
    /// Queue local CRDT changes for synchronization.
    pub async fn add_changes(&self, changes: Vec<Vec<u8>>) {
        let _ = self.event_tx.send(SyncEvent::AddChanges(changes)).await;
    }

    /// Ask the actor to author a fresh snapshot.
    pub async fn create_snapshot(&self) {
        let _ = self.event_tx.send(SyncEvent::CreateSnapshot).await;
    }

    /// Broadcast an awareness payload to the other connected clients.
    pub async fn send_ephemeral_message(&self, data: Vec<u8>) {
        let _ = self
            .event_tx
            .send(SyncEvent::SendEphemeralUpdate {
                data,
                message_type: EphemeralMessageType::Message,
            })
            .await;
    }

    /// Shut the actor down and close the connection.
    pub async fn disconnect(&self) {
        let _ = self.event_tx.send(SyncEvent::Disconnect).await;
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<SyncEvent> {
        self.event_tx.clone()
    }
}

/// The per-document sync actor. See the crate docs for the full protocol
/// flows it implements.
pub struct DocumentSync<H: SyncHost> {
    config: SyncConfig,
    host: Arc<H>,
    state: SyncState,
    context: SyncContext,
    event_rx: mpsc::Receiver<SyncEvent>,
    event_tx: mpsc::Sender<SyncEvent>,
    transport_tx: mpsc::Sender<TransportCommand>,
}

impl<H: SyncHost> DocumentSync<H> {
    pub fn new(
        config: SyncConfig,
        host: Arc<H>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> (Self, DocumentSyncHandle) {
        let (event_tx, event_rx) = mpsc::channel(128);
        let handle = DocumentSyncHandle {
            event_tx: event_tx.clone(),
        };
        let machine = Self {
            config,
            host,
            state: SyncState::Disconnected,
            context: SyncContext::new(),
            event_rx,
            event_tx,
            transport_tx,
        };
        (machine, handle)
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// Drive the actor until it is told to disconnect or its queue closes.
    pub async fn run(mut self) {
        self.state = SyncState::Connecting { retrying: false };
        self.context.reset();
        let _ = self.transport_tx.send(TransportCommand::Connect).await;

        while let Some(event) = self.event_rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    /// Process a single event to completion. Returns `false` once the actor
    /// should stop.
    pub async fn handle_event(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::WebsocketConnected => {
                debug!(doc_id = %self.config.document_id, "websocket connected");
                if self.state != SyncState::Failed {
                    self.state = SyncState::Connected;
                    self.context.unsuccessful_reconnects = 0;
                }
            }
            SyncEvent::WebsocketDisconnected => {
                if matches!(self.state, SyncState::Failed | SyncState::Disconnected) {
                    return true;
                }
                self.state = SyncState::Connecting { retrying: true };
                let delay = self.config.reconnect_base_delay
                    * (1 + self.context.unsuccessful_reconnects);
                self.context.unsuccessful_reconnects += 1;
                debug!(?delay, "websocket disconnected, scheduling retry");
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = event_tx.send(SyncEvent::WebsocketRetry).await;
                });
            }
            SyncEvent::WebsocketRetry => {
                if matches!(self.state, SyncState::Connecting { .. }) {
                    self.context.reset();
                    let _ = self.transport_tx.send(TransportCommand::Connect).await;
                }
            }
            SyncEvent::AddToIncomingQueue(frame) => {
                self.context.incoming_queue.push_back(frame);
                while let Some(frame) = self.context.incoming_queue.pop_front() {
                    if self.state == SyncState::Failed {
                        break;
                    }
                    self.process_frame(frame).await;
                }
            }
            SyncEvent::AddToCustomMessageQueue(message) => {
                self.context.custom_message_queue.push_back(message);
                while let Some(message) = self.context.custom_message_queue.pop_front() {
                    if let Err(err) = self.host.handle_custom_message(message).await {
                        warn!("host failed to handle custom message: {err}");
                    }
                }
            }
            SyncEvent::AddChanges(changes) => {
                self.context.pending_changes_queue.extend(changes);
                self.maybe_send_update().await;
            }
            SyncEvent::CreateSnapshot => {
                self.create_and_send_snapshot().await;
            }
            SyncEvent::SendEphemeralUpdate { data, message_type } => {
                self.send_ephemeral(data, message_type).await;
            }
            SyncEvent::FailedCreatingEphemeralUpdate(err) => {
                self.context.ephemeral_authoring_errors.push(err);
            }
            SyncEvent::Disconnect => {
                let _ = self.transport_tx.send(TransportCommand::Close).await;
                self.state = SyncState::Disconnected;
                return false;
            }
        }
        true
    }

    async fn process_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Document(document) => self.handle_document(document).await,
            Frame::Snapshot(SnapshotFrame { snapshot }) => {
                self.handle_snapshot(snapshot).await;
                if self.state != SyncState::Failed {
                    self.maybe_send_update().await;
                }
            }
            Frame::SnapshotSaved(frame) => self.handle_snapshot_saved(frame).await,
            Frame::SnapshotSaveFailed(frame) => self.handle_snapshot_save_failed(frame).await,
            Frame::Update(update) => self.handle_update(update).await,
            Frame::UpdateSaved(frame) => self.handle_update_saved(frame),
            Frame::UpdateSaveFailed(frame) => self.handle_update_save_failed(frame).await,
            Frame::EphemeralMessage(message) => self.handle_ephemeral(message).await,
            Frame::DocumentNotFound | Frame::Unauthorized | Frame::DocumentError => {
                warn!(doc_id = %self.config.document_id, ?frame, "terminal server signal");
                self.fail(format!("{frame:?}"));
            }
        }
    }

    /// Initial `document` payload: seed the snapshot, replay the updates in
    /// order, then flush anything queued locally.
    async fn handle_document(&mut self, document: DocumentFrame) {
        match document.snapshot {
            None => {
                self.context.document_decryption_state = DocumentDecryptionState::Complete;
                if self.host.should_create_initial_snapshot() {
                    self.create_and_send_snapshot().await;
                }
            }
            Some(snapshot) => {
                let key = match self.load_document_snapshot(&snapshot).await {
                    Ok(key) => key,
                    Err(err) => {
                        self.context.document_decryption_state = DocumentDecryptionState::Failed;
                        self.fail(err.to_string());
                        return;
                    }
                };

                for update in document.updates {
                    if let Err(err) = self.verify_apply_update(&update, &key, false).await {
                        self.context.document_decryption_state =
                            DocumentDecryptionState::Partial;
                        self.fail(err.to_string());
                        return;
                    }
                }
                self.context.document_decryption_state = DocumentDecryptionState::Complete;
            }
        }

        self.maybe_send_update().await;
        self.announce_ephemeral_session().await;
    }

    /// Verify and apply the snapshot of a `document` frame, seeding the
    /// per-connection chain state. Returns the snapshot key for the attached
    /// updates.
    async fn load_document_snapshot(
        &mut self,
        snapshot: &Snapshot,
    ) -> Result<AeadKey, ProcessError> {
        if !self
            .host
            .is_valid_client(&snapshot.public_data.pub_key)
            .await
        {
            return Err(ProcessError::InvalidClient);
        }

        let key = self
            .host
            .get_snapshot_key(Some(&snapshot.public_data))
            .await?;

        // The chain can only be checked against what the client already
        // knows about this document.
        let mut parent = None;
        if let Some(known) = &self.config.known_snapshot_info {
            if known.snapshot_id == snapshot.public_data.snapshot_id {
                // The known snapshot itself came back; its ciphertext must
                // not have changed underneath us.
                if known.ciphertext != snapshot.ciphertext {
                    return Err(ProcessError::Protocol(SecsyncError::SnapshotProofMismatch));
                }
            } else if known.snapshot_id == snapshot.public_data.parent_snapshot_id {
                parent = Some(ParentSnapshotInfo {
                    ciphertext: known.ciphertext.clone(),
                    parent_snapshot_proof: known.parent_snapshot_proof.clone(),
                });
            }
        }

        let content = verify_and_decrypt_snapshot(
            snapshot,
            &key,
            &self.config.document_id,
            parent.as_ref(),
            None,
        )?;
        self.host.apply_snapshot(&content).await?;

        self.context.active_snapshot_id = Some(snapshot.public_data.snapshot_id.clone());
        self.context.updates_local_clock = -1;
        self.context.latest_server_version =
            snapshot.server_data.as_ref().map(|data| data.latest_version);
        self.context
            .snapshot_infos_with_update_clocks
            .push(SnapshotInfoWithUpdateClocks {
                snapshot_id: snapshot.public_data.snapshot_id.clone(),
                ciphertext: snapshot.ciphertext.clone(),
                parent_snapshot_proof: snapshot.public_data.parent_snapshot_proof.clone(),
                public_data: Some(snapshot.public_data.clone()),
                update_clocks: Default::default(),
            });

        Ok(key)
    }

    /// A snapshot broadcast replaces the active snapshot; in-flight updates
    /// are re-anchored and sent again against it.
    ///
    /// Host rejection of the author is only fatal during the initial
    /// document load; here the broadcast is dropped and recorded.
    async fn handle_snapshot(&mut self, snapshot: Snapshot) {
        if !self
            .host
            .is_valid_client(&snapshot.public_data.pub_key)
            .await
        {
            self.record("snapshot author was rejected by the host, snapshot dropped");
            return;
        }

        let key = match self
            .host
            .get_snapshot_key(Some(&snapshot.public_data))
            .await
        {
            Ok(key) => key,
            Err(err) => {
                self.fail(err.to_string());
                return;
            }
        };

        let (parent, known_clocks) = match self.context.active_snapshot_info() {
            Some(info) => (
                Some(ParentSnapshotInfo {
                    ciphertext: info.ciphertext.clone(),
                    parent_snapshot_proof: info.parent_snapshot_proof.clone(),
                }),
                Some(info.update_clocks.clone()),
            ),
            None => (None, None),
        };

        let content = match verify_and_decrypt_snapshot(
            &snapshot,
            &key,
            &self.config.document_id,
            parent.as_ref(),
            known_clocks.as_ref(),
        ) {
            Ok(content) => content,
            Err(err) => {
                self.fail(err.to_string());
                return;
            }
        };

        if let Err(err) = self.host.apply_snapshot(&content).await {
            self.fail(err.to_string());
            return;
        }

        self.context.active_snapshot_id = Some(snapshot.public_data.snapshot_id.clone());
        self.context.latest_server_version =
            snapshot.server_data.as_ref().map(|data| data.latest_version);
        self.context.updates_local_clock = -1;
        self.context
            .snapshot_infos_with_update_clocks
            .push(SnapshotInfoWithUpdateClocks {
                snapshot_id: snapshot.public_data.snapshot_id.clone(),
                ciphertext: snapshot.ciphertext.clone(),
                parent_snapshot_proof: snapshot.public_data.parent_snapshot_proof.clone(),
                public_data: Some(snapshot.public_data.clone()),
                update_clocks: Default::default(),
            });

        // In-flight updates were anchored to the replaced snapshot; their
        // changes go back into the queue to be re-issued.
        let in_flight = std::mem::take(&mut self.context.updates_in_flight);
        let mut requeued: Vec<Vec<u8>> = Vec::new();
        for update in in_flight {
            requeued.extend(update.changes);
        }
        requeued.append(&mut self.context.pending_changes_queue);
        self.context.pending_changes_queue = requeued;
    }

    async fn handle_update(&mut self, update: Update) {
        let key = {
            let public_data = self
                .context
                .active_snapshot_info()
                .and_then(|info| info.public_data.clone());
            match self.host.get_snapshot_key(public_data.as_ref()).await {
                Ok(key) => key,
                Err(err) => {
                    self.fail(err.to_string());
                    return;
                }
            }
        };

        if let Err(err) = self.verify_apply_update(&update, &key, true).await {
            match err {
                ProcessError::InvalidClient => {
                    self.record("update author was rejected by the host, update dropped");
                }
                err => self.fail(err.to_string()),
            }
        }
    }

    /// Shared update verification and application path; used for the
    /// `document` payload (own updates included) and live broadcasts (own
    /// updates skipped).
    async fn verify_apply_update(
        &mut self,
        update: &Update,
        key: &AeadKey,
        skip_own: bool,
    ) -> Result<(), ProcessError> {
        let active_snapshot_id = self
            .context
            .active_snapshot_id
            .clone()
            .ok_or(ProcessError::Protocol(SecsyncError::UpdateWrongSnapshot))?;

        let author = update.public_data.pub_key;
        let own_public_key = self.config.signing_key.public_key();

        if skip_own && author == own_public_key {
            return Ok(());
        }

        if !self.host.is_valid_client(&author).await {
            return Err(ProcessError::InvalidClient);
        }

        let current_clock = self
            .context
            .active_snapshot_info()
            .and_then(|info| info.update_clocks.get(&author.to_base64()))
            .map(|clock| *clock as i64)
            .unwrap_or(-1);

        let outcome = verify_and_decrypt_update(
            update,
            key,
            &active_snapshot_id,
            &author,
            current_clock,
            false,
            skip_own,
            &own_public_key,
        )?;

        if let UpdateOutcome::Applied { content, clock } = outcome {
            let changes = self.host.deserialize_changes(&content)?;
            self.host.apply_changes(changes).await?;

            if let Some(info) = self.context.active_snapshot_info_mut() {
                info.update_clocks.insert(author.to_base64(), clock);
            }
            if let Some(server_data) = &update.server_data {
                self.context.latest_server_version = Some(server_data.version);
            }
        }

        Ok(())
    }

    fn handle_update_saved(&mut self, frame: UpdateSavedFrame) {
        self.context
            .updates_in_flight
            .retain(|in_flight| in_flight.clock != frame.clock);
        self.context.latest_server_version = Some(frame.server_version);

        // Track our own confirmed clock so snapshots we or others take
        // record it.
        let own = self.config.signing_key.public_key().to_base64();
        if self.context.active_snapshot_id.as_deref() == Some(frame.snapshot_id.as_str()) {
            if let Some(info) = self.context.active_snapshot_info_mut() {
                let entry = info.update_clocks.entry(own).or_insert(frame.clock);
                *entry = (*entry).max(frame.clock);
            }
        }
    }

    /// Resubmit with the same clock: the server identifies updates by
    /// `(refSnapshotId, pubKey, clock)`.
    async fn handle_update_save_failed(&mut self, frame: UpdateSaveFailedFrame) {
        let active = self.context.active_snapshot_id.clone();
        let mut resend: Option<Update> = None;
        let mut requeue: Option<Vec<Vec<u8>>> = None;

        if let Some(position) = self
            .context
            .updates_in_flight
            .iter()
            .position(|in_flight| in_flight.clock == frame.clock)
        {
            if active.as_deref() == Some(frame.snapshot_id.as_str()) {
                resend = Some(self.context.updates_in_flight[position].update.clone());
            } else {
                // The snapshot changed underneath the update; its changes
                // must be re-anchored instead of resent.
                let in_flight = self.context.updates_in_flight.remove(position);
                requeue = Some(in_flight.changes);
            }
        }

        if let Some(update) = resend {
            debug!(clock = frame.clock, "resubmitting update");
            self.send_frame(Frame::Update(update)).await;
        }
        if let Some(mut changes) = requeue {
            changes.append(&mut self.context.pending_changes_queue);
            self.context.pending_changes_queue = changes;
            self.maybe_send_update().await;
        }
    }

    /// Bundle the pending changes into one update and send it. Deferred
    /// while a snapshot is in flight or the document is not fully loaded.
    async fn maybe_send_update(&mut self) {
        if self.state != SyncState::Connected
            || self.context.document_decryption_state != DocumentDecryptionState::Complete
            || self.context.snapshot_in_flight.is_some()
            || self.context.pending_changes_queue.is_empty()
        {
            return;
        }
        let Some(active_snapshot_id) = self.context.active_snapshot_id.clone() else {
            return;
        };

        let public_data = self
            .context
            .active_snapshot_info()
            .and_then(|info| info.public_data.clone());
        let key = match self.host.get_snapshot_key(public_data.as_ref()).await {
            Ok(key) => key,
            Err(err) => {
                self.context.last_error = Some(err.to_string());
                warn!("could not fetch snapshot key for update: {err}");
                return;
            }
        };

        let changes = std::mem::take(&mut self.context.pending_changes_queue);
        let content = match self.host.serialize_changes(&changes) {
            Ok(content) => content,
            Err(err) => {
                self.context.pending_changes_queue = changes;
                self.context.last_error = Some(err.to_string());
                warn!("could not serialize changes: {err}");
                return;
            }
        };

        let clock = (self.context.updates_local_clock + 1) as u64;
        let public_data = UpdatePublicData {
            ref_snapshot_id: active_snapshot_id,
            doc_id: self.config.document_id.clone(),
            pub_key: self.config.signing_key.public_key(),
            clock: 0,
        };
        let update = match create_update(
            &content,
            public_data,
            &key,
            &self.config.signing_key,
            clock,
        ) {
            Ok(update) => update,
            Err(err) => {
                self.context.pending_changes_queue = changes;
                self.context.last_error = Some(err.to_string());
                warn!("could not create update: {err}");
                return;
            }
        };

        self.context.updates_local_clock = clock as i64;
        self.context.updates_in_flight.push(UpdateInFlight {
            clock,
            update: update.clone(),
            changes,
        });
        self.send_frame(Frame::Update(update)).await;
    }

    /// Author a fresh snapshot from host state and send it. Further local
    /// updates are deferred until the server confirms or rejects it.
    async fn create_and_send_snapshot(&mut self) {
        if self.context.snapshot_in_flight.is_some() {
            return;
        }

        let new_snapshot = match self.host.get_new_snapshot_data().await {
            Ok(data) => data,
            Err(err) => {
                self.context.last_error = Some(err.to_string());
                warn!("could not fetch new snapshot data: {err}");
                return;
            }
        };

        let (parent_snapshot_id, parent_ciphertext, grandparent_proof, update_clocks) =
            match self.context.active_snapshot_info() {
                Some(info) => (
                    info.snapshot_id.clone(),
                    info.ciphertext.clone(),
                    info.parent_snapshot_proof.clone(),
                    info.update_clocks
                        .iter()
                        .map(|(author, clock)| (author.clone(), *clock))
                        .collect::<BTreeMap<String, u64>>(),
                ),
                None => (String::new(), String::new(), String::new(), BTreeMap::new()),
            };

        let public_data = SnapshotPublicData {
            snapshot_id: new_snapshot.id,
            doc_id: self.config.document_id.clone(),
            pub_key: self.config.signing_key.public_key(),
            parent_snapshot_id,
            parent_snapshot_proof: String::new(),
            parent_snapshot_update_clocks: update_clocks,
            additional: new_snapshot.public_data,
        };

        let snapshot = match create_snapshot(
            &new_snapshot.data,
            public_data,
            &new_snapshot.key,
            &self.config.signing_key,
            &parent_ciphertext,
            &grandparent_proof,
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.context.last_error = Some(err.to_string());
                warn!("could not create snapshot: {err}");
                return;
            }
        };

        self.context.snapshot_in_flight = Some(SnapshotInFlight {
            snapshot: snapshot.clone(),
        });
        self.send_frame(Frame::Snapshot(SnapshotFrame { snapshot })).await;
    }

    async fn handle_snapshot_saved(&mut self, frame: SnapshotSavedFrame) {
        let Some(in_flight) = self.context.snapshot_in_flight.take() else {
            return;
        };
        if in_flight.snapshot.public_data.snapshot_id != frame.snapshot_id {
            // Confirmation for a snapshot we are no longer waiting on.
            return;
        }

        self.context.active_snapshot_id = Some(frame.snapshot_id);
        self.context.latest_server_version = None;
        self.context.updates_local_clock = -1;
        self.context
            .snapshot_infos_with_update_clocks
            .push(SnapshotInfoWithUpdateClocks {
                snapshot_id: in_flight.snapshot.public_data.snapshot_id.clone(),
                ciphertext: in_flight.snapshot.ciphertext.clone(),
                parent_snapshot_proof: in_flight
                    .snapshot
                    .public_data
                    .parent_snapshot_proof
                    .clone(),
                public_data: Some(in_flight.snapshot.public_data.clone()),
                update_clocks: Default::default(),
            });

        self.maybe_send_update().await;
    }

    /// The server refused our snapshot. Apply whatever catch-up material it
    /// attached, drop the pending changes (the retried snapshot re-includes
    /// them through the host's CRDT state) and try again.
    async fn handle_snapshot_save_failed(&mut self, frame: SnapshotSaveFailedFrame) {
        self.context.snapshot_in_flight = None;

        if let Some(snapshot) = frame.snapshot {
            self.handle_snapshot(snapshot).await;
            if self.state == SyncState::Failed {
                return;
            }
        }

        if let Some(updates) = frame.updates {
            let public_data = self
                .context
                .active_snapshot_info()
                .and_then(|info| info.public_data.clone());
            let key = match self.host.get_snapshot_key(public_data.as_ref()).await {
                Ok(key) => key,
                Err(err) => {
                    self.fail(err.to_string());
                    return;
                }
            };
            for update in updates {
                if let Err(err) = self.verify_apply_update(&update, &key, true).await {
                    match err {
                        ProcessError::InvalidClient => {
                            self.record(
                                "update author was rejected by the host, update dropped",
                            );
                        }
                        err => {
                            self.fail(err.to_string());
                            return;
                        }
                    }
                }
            }
        }

        self.context.pending_changes_queue.clear();
        self.create_and_send_snapshot().await;
    }

    async fn handle_ephemeral(&mut self, message: secsync_core::EphemeralMessage) {
        // Wrong-document envelopes are counted but never applied.
        if message.public_data.doc_id != self.config.document_id {
            self.context
                .ephemeral_receiving_errors
                .push(SecsyncError::EphemeralDocIdMismatch.code());
            return;
        }

        if !self
            .host
            .is_valid_client(&message.public_data.pub_key)
            .await
        {
            self.context
                .ephemeral_receiving_errors
                .push(SecsyncError::EphemeralInvalidClient.code());
            return;
        }

        let key = match self.host.get_ephemeral_message_key().await {
            Ok(key) => key,
            Err(err) => {
                self.context.ephemeral_receiving_errors.push(err.to_string());
                return;
            }
        };

        let author = message.public_data.pub_key;
        let result = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            &self.config.document_id,
            &mut self.context.ephemeral_session,
            &self.config.signing_key,
            |_| true,
        );

        match result {
            Ok(outcome) => {
                if let Some(proof) = outcome.proof {
                    self.send_frame(Frame::EphemeralMessage(proof)).await;
                }
                if let Some(content) = outcome.content {
                    if let Err(err) = self.host.apply_ephemeral_message(&content, &author).await {
                        self.context.ephemeral_receiving_errors.push(err.to_string());
                    }
                }
            }
            Err(err) => {
                if let Some(proof) = err.proof {
                    self.send_frame(Frame::EphemeralMessage(proof)).await;
                }
                self.context.ephemeral_receiving_errors.push(err.error.code());
            }
        }
    }

    async fn send_ephemeral(&mut self, data: Vec<u8>, message_type: EphemeralMessageType) {
        let key = match self.host.get_ephemeral_message_key().await {
            Ok(key) => key,
            Err(err) => {
                self.context.ephemeral_authoring_errors.push(err.to_string());
                return;
            }
        };

        let message = match create_ephemeral_message(
            &data,
            message_type,
            &mut self.context.ephemeral_session,
            &self.config.document_id,
            &key,
            &self.config.signing_key,
        ) {
            Ok(message) => message,
            Err(err) => {
                self.context.ephemeral_authoring_errors.push(err.code());
                return;
            }
        };

        self.send_frame(Frame::EphemeralMessage(message)).await;
    }

    /// Announce a fresh ephemeral session to the other clients so they can
    /// prove theirs to us.
    async fn announce_ephemeral_session(&mut self) {
        if self.state != SyncState::Connected {
            return;
        }
        self.send_ephemeral(Vec::new(), EphemeralMessageType::Initialize)
            .await;
    }

    async fn send_frame(&self, frame: Frame) {
        let _ = self
            .transport_tx
            .send(TransportCommand::Send(frame.to_wire()))
            .await;
    }

    /// Record a non-fatal protocol event for observability.
    fn record(&mut self, error: impl Into<String>) {
        let error = error.into();
        warn!(doc_id = %self.config.document_id, "{error}");
        self.context.last_error = Some(error);
    }

    fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        error!(doc_id = %self.config.document_id, "sync failed: {error}");
        self.context.last_error = Some(error);
        self.state = SyncState::Failed;
    }
}
