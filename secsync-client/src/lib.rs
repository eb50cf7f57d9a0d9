// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side synchronization for secsync documents.
//!
//! The heart of this crate is [`DocumentSync`], an actor owning one
//! document's sync context: connection life cycle, incoming frame
//! processing, in-flight snapshot and update tracking, pending-changes
//! buffering, reconnection with backoff and the ephemeral session
//! sub-protocol. [`TransportActor`] adapts a websocket to the actor's event
//! queue. Host applications implement [`SyncHost`] to adapt their CRDT.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(host: Arc<impl secsync_client::SyncHost>) {
//! use secsync_client::{spawn, SyncConfig};
//! use secsync_core::PrivateKey;
//!
//! let config = SyncConfig::new(
//!     "my-document",
//!     "wss://secsync.example.com",
//!     "session-key",
//!     PrivateKey::new(),
//! );
//! let (handle, _task) = spawn(config, host);
//! handle.add_changes(vec![b"change".to_vec()]).await;
//! # }
//! ```
use std::sync::Arc;

pub mod config;
pub mod context;
pub mod host;
pub mod machine;
#[cfg(test)]
mod test_utils;
pub mod transport;

pub use config::{KnownSnapshotInfo, LoggingLevel, SyncConfig};
pub use context::{
    DocumentDecryptionState, ErrorBuffer, SnapshotInFlight, SnapshotInfoWithUpdateClocks,
    SyncContext, UpdateInFlight, ERROR_BUFFER_CAPACITY,
};
pub use host::{HostError, HostResult, NewSnapshotData, SyncHost};
pub use machine::{DocumentSync, DocumentSyncHandle, SyncEvent, SyncState};
pub use transport::{TransportActor, TransportCommand};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Wire a [`DocumentSync`] actor to a [`TransportActor`] and spawn both.
///
/// The returned task finishes once the actor is disconnected; dropping the
/// handle alone does not stop it.
pub fn spawn<H: SyncHost>(config: SyncConfig, host: Arc<H>) -> (DocumentSyncHandle, JoinHandle<()>) {
    let (transport_tx, transport_rx) = mpsc::channel(128);
    let (machine, handle) = DocumentSync::new(config.clone(), host, transport_tx);
    let transport = TransportActor::new(&config, handle.sender());

    let task = tokio::spawn(async move {
        let transport_task = tokio::spawn(transport.run(transport_rx));
        machine.run().await;
        // The machine dropped its command sender; the transport actor winds
        // down once it observes the closed channel.
        let _ = transport_task.await;
    });

    (handle, task)
}
