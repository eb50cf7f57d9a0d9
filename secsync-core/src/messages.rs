// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire frames exchanged over the document channel.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Frames with
//! types outside this set are passed through to the host application
//! untouched.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ephemeral::EphemeralMessage;
use crate::snapshot::Snapshot;
use crate::update::Update;

/// All frames either side may put on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Initial server payload after a successful subscription.
    Document(DocumentFrame),
    /// A snapshot: client → server to save it, server → others on accept.
    Snapshot(SnapshotFrame),
    /// Acknowledgement to the snapshot's author.
    SnapshotSaved(SnapshotSavedFrame),
    /// The server refused a snapshot, attaching what the client needs to
    /// catch up.
    SnapshotSaveFailed(SnapshotSaveFailedFrame),
    /// An update: client → server to save it, server → others on accept.
    Update(Update),
    /// Acknowledgement to the update's author.
    UpdateSaved(UpdateSavedFrame),
    /// The server refused an update; the client resubmits with the same
    /// clock.
    UpdateSaveFailed(UpdateSaveFailedFrame),
    /// Relayed awareness payload, never persisted.
    EphemeralMessage(EphemeralMessage),
    /// Terminal: the requested document does not exist.
    DocumentNotFound,
    /// Terminal: the client may not access this document.
    Unauthorized,
    /// Terminal: the server failed while loading the document.
    DocumentError,
}

impl Frame {
    /// Parse a frame from raw wire text. Returns `Err` with the parsed JSON
    /// when the `type` is not part of the protocol, so callers can hand the
    /// message to the host.
    pub fn from_wire(text: &str) -> Result<Frame, Option<Value>> {
        let value: Value = serde_json::from_str(text).map_err(|_| None)?;
        match serde_json::from_value::<Frame>(value.clone()) {
            Ok(frame) => Ok(frame),
            Err(_) => Err(Some(value)),
        }
    }

    /// Serialize for the wire.
    pub fn to_wire(&self) -> String {
        // All frame types are plain data, serialization cannot fail.
        serde_json::to_string(self).expect("frame serializes to json")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFrame {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub updates: Vec<Update>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFrame {
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSavedFrame {
    pub doc_id: String,
    pub snapshot_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSaveFailedFrame {
    pub doc_id: String,
    /// Present when the client's snapshot was based on an outdated parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Present when the snapshot missed updates the server already accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Update>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSavedFrame {
    pub doc_id: String,
    pub snapshot_id: String,
    pub clock: u64,
    pub server_version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSaveFailedFrame {
    pub doc_id: String,
    pub snapshot_id: String,
    pub clock: u64,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Map};

    use crate::identity::PrivateKey;
    use crate::snapshot::{create_snapshot, SnapshotPublicData};
    use crate::test_utils::{test_key, TEST_DOC_ID};

    use super::{Frame, SnapshotFrame, UpdateSavedFrame};

    #[test]
    fn tagged_by_type() {
        let frame = Frame::UpdateSaved(UpdateSavedFrame {
            doc_id: "doc".to_string(),
            snapshot_id: "snap".to_string(),
            clock: 3,
            server_version: 7,
        });

        let wire = frame.to_wire();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "update-saved");
        assert_eq!(value["serverVersion"], 7);

        assert_eq!(Frame::from_wire(&wire).unwrap(), frame);
    }

    #[test]
    fn snapshot_frame_flattens_envelope() {
        let signing_key = PrivateKey::new();
        let snapshot = create_snapshot(
            b"state",
            SnapshotPublicData {
                snapshot_id: "snap".to_string(),
                doc_id: TEST_DOC_ID.to_string(),
                pub_key: signing_key.public_key(),
                parent_snapshot_id: String::new(),
                parent_snapshot_proof: String::new(),
                parent_snapshot_update_clocks: BTreeMap::new(),
                additional: Map::new(),
            },
            &test_key(),
            &signing_key,
            "",
            "",
        )
        .unwrap();

        let wire = Frame::Snapshot(SnapshotFrame { snapshot }).to_wire();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "snapshot");
        // The envelope fields sit at the frame's top level.
        assert!(value["ciphertext"].is_string());
        assert!(value["publicData"]["snapshotId"].is_string());
    }

    #[test]
    fn unit_frames() {
        let wire = Frame::DocumentNotFound.to_wire();
        assert_eq!(wire, r#"{"type":"document-not-found"}"#);
        assert_eq!(Frame::from_wire(&wire).unwrap(), Frame::DocumentNotFound);
    }

    #[test]
    fn unknown_type_goes_to_host() {
        let text = json!({ "type": "presence-summary", "users": 4 }).to_string();
        let result = Frame::from_wire(&text);
        let value = result.unwrap_err().unwrap();
        assert_eq!(value["type"], "presence-summary");
    }

    #[test]
    fn invalid_json_is_dropped() {
        assert!(Frame::from_wire("not json").unwrap_err().is_none());
    }
}
