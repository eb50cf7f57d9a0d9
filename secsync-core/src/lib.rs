// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message formats, cryptography and session handling for the secsync
//! protocol.
//!
//! Secsync synchronizes end-to-end-encrypted CRDT documents through an
//! untrusted relay. This crate holds everything both sides agree on: the
//! envelope codecs for snapshots, updates and ephemeral messages, the
//! canonical JSON encoding they sign, the snapshot proof chain, the
//! ephemeral session protocol and the stable error taxonomy.
pub mod aead;
pub mod canonical;
pub mod encoding;
mod envelope;
pub mod ephemeral;
pub mod error;
pub mod hash;
pub mod identity;
pub mod messages;
pub mod snapshot;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod update;

pub use aead::{AeadError, AeadKey, AeadNonce};
pub use canonical::{canonicalize, CanonicalizeError};
pub use encoding::{from_base64, generate_id, generate_id_bytes, to_base64, ID_LEN};
pub use ephemeral::{
    create_ephemeral_message, create_ephemeral_session_proof, verify_and_decrypt_ephemeral_message,
    verify_ephemeral_session_proof, EphemeralMessage, EphemeralMessageOutcome,
    EphemeralMessageType, EphemeralPublicData, EphemeralSession, EphemeralVerifyError, PeerSession,
};
pub use error::SecsyncError;
pub use hash::{Hash, HASH_LEN};
pub use identity::{IdentityError, PrivateKey, PublicKey, Signature, SIGNATURE_LENGTH};
pub use messages::{
    DocumentFrame, Frame, SnapshotFrame, SnapshotSaveFailedFrame, SnapshotSavedFrame,
    UpdateSaveFailedFrame, UpdateSavedFrame,
};
pub use snapshot::{
    create_parent_snapshot_proof, create_snapshot, verify_and_decrypt_snapshot, CreateSnapshotError,
    ParentSnapshotInfo, Snapshot, SnapshotPublicData, SnapshotServerData,
};
pub use update::{
    create_update, verify_and_decrypt_update, CreateUpdateError, Update, UpdateOutcome,
    UpdatePublicData, UpdateServerData,
};
