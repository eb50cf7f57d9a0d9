// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-document connection fan-out.
//!
//! Connections are registered under an id owned by the registry; broadcast
//! iterates over a snapshot of the senders so registration changes during a
//! fan-out cannot invalidate the iteration.
use std::collections::HashMap;

use secsync_core::Frame;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

pub type ConnectionId = u64;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    documents: RwLock<HashMap<String, HashMap<ConnectionId, mpsc::Sender<Frame>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        doc_id: &str,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Frame>,
    ) {
        let mut documents = self.documents.write().await;
        documents
            .entry(doc_id.to_string())
            .or_default()
            .insert(connection_id, sender);
    }

    pub async fn unregister(&self, doc_id: &str, connection_id: ConnectionId) {
        let mut documents = self.documents.write().await;
        if let Some(connections) = documents.get_mut(doc_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                documents.remove(doc_id);
            }
        }
    }

    /// Send a frame to every connection on the document except `except`.
    pub async fn broadcast(&self, doc_id: &str, except: Option<ConnectionId>, frame: Frame) {
        let senders: Vec<(ConnectionId, mpsc::Sender<Frame>)> = {
            let documents = self.documents.read().await;
            match documents.get(doc_id) {
                Some(connections) => connections
                    .iter()
                    .filter(|(id, _)| Some(**id) != except)
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return,
            }
        };

        for (connection_id, sender) in senders {
            if sender.send(frame.clone()).await.is_err() {
                // The connection task is gone; it unregisters itself.
                trace!(connection_id, "skipping closed connection");
            }
        }
    }

    pub async fn connection_count(&self, doc_id: &str) -> usize {
        self.documents
            .read()
            .await
            .get(doc_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }
}
