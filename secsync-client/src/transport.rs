// SPDX-License-Identifier: MIT OR Apache-2.0

//! Websocket transport actor.
//!
//! Translates wire frames into sync events and outgoing envelopes into text
//! frames. Owns the socket exclusively; the sync actor only holds the
//! command sender. Connection attempts are armed with an open timeout, and
//! every failure surfaces as a single `WebsocketDisconnected` event so the
//! sync actor drives all retry policy.
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::machine::SyncEvent;
use secsync_core::Frame;

/// Commands the sync actor sends to its transport.
#[derive(Debug)]
pub enum TransportCommand {
    /// Open (or re-open) the websocket.
    Connect,
    /// Send one serialized frame. Dropped when not connected.
    Send(String),
    /// Close the socket and stop the actor.
    Close,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TransportActor {
    url: String,
    connect_timeout: std::time::Duration,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl TransportActor {
    pub fn new(config: &SyncConfig, event_tx: mpsc::Sender<SyncEvent>) -> Self {
        Self {
            url: config.websocket_url(),
            connect_timeout: config.connect_timeout,
            event_tx,
        }
    }

    pub async fn run(self, mut command_rx: mpsc::Receiver<TransportCommand>) {
        let mut socket: Option<Socket> = None;

        loop {
            let disconnected = match socket.as_mut() {
                None => match command_rx.recv().await {
                    None | Some(TransportCommand::Close) => break,
                    Some(TransportCommand::Send(_)) => {
                        trace!("dropping outgoing frame while disconnected");
                        false
                    }
                    Some(TransportCommand::Connect) => {
                        socket = self.connect().await;
                        socket.is_none()
                    }
                },
                Some(stream) => {
                    tokio::select! {
                        command = command_rx.recv() => match command {
                            None | Some(TransportCommand::Close) => {
                                let _ = stream.close(None).await;
                                break;
                            }
                            Some(TransportCommand::Connect) => {
                                // Already connected.
                                false
                            }
                            Some(TransportCommand::Send(text)) => {
                                match stream.send(Message::Text(text)).await {
                                    Ok(()) => false,
                                    Err(err) => {
                                        warn!("websocket send failed: {err}");
                                        true
                                    }
                                }
                            }
                        },
                        incoming = stream.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                self.dispatch(&text).await;
                                false
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("websocket closed by remote");
                                true
                            }
                            Some(Ok(_)) => {
                                // Binary, ping and pong frames are not part
                                // of the protocol.
                                false
                            }
                            Some(Err(err)) => {
                                warn!("websocket receive failed: {err}");
                                true
                            }
                        },
                    }
                }
            };

            if disconnected {
                socket = None;
                self.emit(SyncEvent::WebsocketDisconnected).await;
            }
        }
    }

    async fn connect(&self) -> Option<Socket> {
        debug!(url = %self.url, "opening websocket");
        match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => {
                self.emit(SyncEvent::WebsocketConnected).await;
                Some(socket)
            }
            Ok(Err(err)) => {
                warn!("websocket connect failed: {err}");
                None
            }
            Err(_) => {
                warn!("websocket did not open within {:?}", self.connect_timeout);
                None
            }
        }
    }

    /// Known frame types feed the incoming queue, everything else goes to
    /// the custom message queue for the host.
    async fn dispatch(&self, text: &str) {
        match Frame::from_wire(text) {
            Ok(frame) => {
                self.emit(SyncEvent::AddToIncomingQueue(frame)).await;
            }
            Err(Some(value)) => {
                self.emit(SyncEvent::AddToCustomMessageQueue(value)).await;
            }
            Err(None) => {
                warn!("dropping non-json websocket message");
            }
        }
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event).await;
    }
}
