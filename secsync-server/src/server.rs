// SPDX-License-Identifier: MIT OR Apache-2.0

//! Websocket accept loop.
//!
//! One task per connection. The document id comes from the request path
//! (`/<docId>?sessionKey=…`); key distribution and authorization live in a
//! layer above this crate, the relay only ever sees ciphertext.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use secsync_core::{DocumentFrame, Frame};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::connection::DocumentConnection;
use crate::registry::ConnectionRegistry;
use crate::store::{DocumentStore, StoreError};

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// Create documents on first subscription instead of answering
    /// `document-not-found`.
    pub create_missing_documents: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            create_missing_documents: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("websocket handshake or transfer failed: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("connection url carries no document id")]
    MissingDocumentId,
}

/// The relay server: accepts websocket subscriptions and wires each one to
/// a [`DocumentConnection`].
pub struct SyncServer<S: DocumentStore> {
    store: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl<S: DocumentStore> SyncServer<S> {
    pub fn new(store: S, config: ServerConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accept connections forever.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    trace!(%peer_addr, "incoming connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            debug!(%peer_addr, "connection ended with error: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let mut request_path = None;
        let mut socket = accept_hdr_async(stream, |request: &Request, response: Response| {
            request_path = Some(request.uri().path().to_string());
            Ok(response)
        })
        .await?;

        let doc_id = request_path
            .as_deref()
            .map(|path| path.trim_start_matches('/').to_string())
            .filter(|doc_id| !doc_id.is_empty())
            .ok_or(ServerError::MissingDocumentId)?;

        let document = match self.store.load_document(&doc_id).await? {
            Some(document) => document,
            None if self.config.create_missing_documents => {
                self.store.create_document(&doc_id).await?;
                DocumentFrame {
                    doc_id: doc_id.clone(),
                    snapshot: None,
                    updates: Vec::new(),
                }
            }
            None => {
                debug!(%doc_id, "unknown document");
                socket
                    .send(Message::Text(Frame::DocumentNotFound.to_wire()))
                    .await?;
                socket.close(None).await?;
                return Ok(());
            }
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(64);
        self.registry
            .register(&doc_id, connection_id, outgoing_tx.clone())
            .await;
        let connection = DocumentConnection::new(
            doc_id.clone(),
            connection_id,
            self.store.clone(),
            self.registry.clone(),
            outgoing_tx,
        );

        debug!(%doc_id, connection_id, "subscribed");
        socket
            .send(Message::Text(Frame::Document(document).to_wire()))
            .await?;

        loop {
            tokio::select! {
                outgoing = outgoing_rx.recv() => match outgoing {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.to_wire())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match Frame::from_wire(&text) {
                        Ok(frame) => connection.handle_frame(frame).await,
                        Err(_) => trace!(%doc_id, "ignoring unknown client message"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames are not part of the
                        // protocol.
                    }
                    Some(Err(err)) => {
                        debug!(%doc_id, "websocket receive failed: {err}");
                        break;
                    }
                },
            }
        }

        self.registry.unregister(&doc_id, connection_id).await;
        debug!(%doc_id, connection_id, "unsubscribed");
        Ok(())
    }
}
