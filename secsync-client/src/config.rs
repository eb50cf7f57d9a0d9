// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client configuration, all explicit at construction.
use std::time::Duration;

use secsync_core::PrivateKey;

/// How chatty the sync actor is on the `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoggingLevel {
    Off,
    #[default]
    Error,
    Debug,
}

impl LoggingLevel {
    /// The matching `tracing` level, `None` for [`LoggingLevel::Off`].
    /// Hosts feed this into their subscriber's filter.
    pub fn max_level(&self) -> Option<tracing::Level> {
        match self {
            LoggingLevel::Off => None,
            LoggingLevel::Error => Some(tracing::Level::ERROR),
            LoggingLevel::Debug => Some(tracing::Level::DEBUG),
        }
    }
}

/// What the client already knows about the document's snapshot chain, e.g.
/// from local storage. Used to verify the parent proof of the first snapshot
/// the server delivers.
#[derive(Clone, Debug)]
pub struct KnownSnapshotInfo {
    pub snapshot_id: String,
    /// base64url ciphertext of the known snapshot.
    pub ciphertext: String,
    pub parent_snapshot_proof: String,
}

/// Configuration for a [`DocumentSync`](crate::DocumentSync) actor.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub document_id: String,
    /// e.g. `wss://secsync.example.com`.
    pub websocket_host: String,
    /// Appended to the connection url as the `sessionKey` query parameter.
    pub websocket_session_key: String,
    pub signing_key: PrivateKey,
    pub logging: LoggingLevel,
    pub known_snapshot_info: Option<KnownSnapshotInfo>,
    /// Base delay for reconnect backoff; the n-th unsuccessful reconnect
    /// waits `base * (1 + n)`.
    pub reconnect_base_delay: Duration,
    /// Maximum time to wait for the websocket to open.
    pub connect_timeout: Duration,
}

impl SyncConfig {
    pub fn new(
        document_id: impl Into<String>,
        websocket_host: impl Into<String>,
        websocket_session_key: impl Into<String>,
        signing_key: PrivateKey,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            websocket_host: websocket_host.into(),
            websocket_session_key: websocket_session_key.into(),
            signing_key,
            logging: LoggingLevel::default(),
            known_snapshot_info: None,
            reconnect_base_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// The full connection url for this document.
    pub fn websocket_url(&self) -> String {
        format!(
            "{}/{}?sessionKey={}",
            self.websocket_host, self.document_id, self.websocket_session_key
        )
    }
}
