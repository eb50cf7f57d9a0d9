// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot envelopes: authenticated-encrypted full-state checkpoints.
//!
//! Each snapshot commits to its parent through `parentSnapshotProof`, the
//! BLAKE3 hash over the parent's ciphertext concatenated with the
//! grandparent's proof. The proofs form a hash chain back to the first
//! snapshot of the document; breaking any earlier ciphertext invalidates all
//! descendants. `parentSnapshotUpdateClocks` records the per-author update
//! clocks observed before the snapshot was taken, so a snapshot cannot
//! silently drop updates.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::aead::{open, random_nonce, seal, AeadError, AeadKey, AeadNonce};
use crate::canonical::CanonicalizeError;
use crate::encoding::{from_base64, to_base64};
use crate::envelope::{encode_public_data, signed_payload};
use crate::error::SecsyncError;
use crate::hash::Hash;
use crate::identity::{PrivateKey, PublicKey, Signature};

/// Public (unencrypted but authenticated) fields of a snapshot.
///
/// Hosts may attach additional fields; they travel inside the canonical
/// encoding and are covered by both the AEAD tag and the signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPublicData {
    pub snapshot_id: String,
    pub doc_id: String,
    pub pub_key: PublicKey,
    /// Empty string for the first snapshot of a document.
    pub parent_snapshot_id: String,
    /// Filled in by [`create_snapshot`].
    #[serde(default)]
    pub parent_snapshot_proof: String,
    /// Per-author update clocks observed before taking the snapshot, keyed
    /// by the author's base64url public key.
    pub parent_snapshot_update_clocks: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// Version information the server attaches when delivering a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotServerData {
    pub latest_version: u64,
}

/// A complete snapshot envelope as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: Signature,
    pub public_data: SnapshotPublicData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<SnapshotServerData>,
}

/// Caller-supplied material to recompute the parent proof during
/// verification.
#[derive(Clone, Debug, Default)]
pub struct ParentSnapshotInfo {
    /// base64url ciphertext of the parent snapshot, empty for a genesis
    /// snapshot.
    pub ciphertext: String,
    /// The parent's own `parentSnapshotProof`, empty for a genesis snapshot.
    pub parent_snapshot_proof: String,
}

/// Compute the hash-chain commitment for a child of the given snapshot.
///
/// The genesis snapshot hashes two empty strings.
pub fn create_parent_snapshot_proof(parent_ciphertext: &str, grandparent_proof: &str) -> String {
    Hash::over(&[parent_ciphertext.as_bytes(), grandparent_proof.as_bytes()]).to_base64()
}

/// Encrypt and sign a snapshot of the given document state.
///
/// `public_data.parent_snapshot_proof` is computed here from the parent's
/// ciphertext and the grandparent's proof and overwrites whatever the caller
/// put there.
pub fn create_snapshot(
    content: &[u8],
    mut public_data: SnapshotPublicData,
    key: &AeadKey,
    signing_key: &PrivateKey,
    parent_snapshot_ciphertext: &str,
    grandparent_snapshot_proof: &str,
) -> Result<Snapshot, CreateSnapshotError> {
    public_data.parent_snapshot_proof =
        create_parent_snapshot_proof(parent_snapshot_ciphertext, grandparent_snapshot_proof);

    let public_data_encoded = encode_public_data(&public_data)?;
    let nonce = random_nonce();
    let ciphertext = seal(key, content, nonce, public_data_encoded.as_bytes())?;

    let nonce_encoded = to_base64(&nonce);
    let ciphertext_encoded = to_base64(&ciphertext);
    let payload = signed_payload(&nonce_encoded, &ciphertext_encoded, &public_data_encoded)?;
    let signature = signing_key.sign(&payload);

    Ok(Snapshot {
        ciphertext: ciphertext_encoded,
        nonce: nonce_encoded,
        signature,
        public_data,
        server_data: None,
    })
}

/// Verify a snapshot envelope and decrypt the document state.
///
/// Checks, in order: the author signature, the parent proof chain (when
/// `parent` is supplied), the document id, the recorded update clocks
/// against locally applied ones (when `known_update_clocks` is supplied),
/// and finally the AEAD tag during decryption.
pub fn verify_and_decrypt_snapshot(
    snapshot: &Snapshot,
    key: &AeadKey,
    doc_id: &str,
    parent: Option<&ParentSnapshotInfo>,
    known_update_clocks: Option<&HashMap<String, u64>>,
) -> Result<Vec<u8>, SecsyncError> {
    let public_data_encoded = encode_public_data(&snapshot.public_data)
        .map_err(|_| SecsyncError::SnapshotDecryptionFailed)?;
    let payload = signed_payload(&snapshot.nonce, &snapshot.ciphertext, &public_data_encoded)
        .map_err(|_| SecsyncError::SnapshotDecryptionFailed)?;

    if !snapshot
        .public_data
        .pub_key
        .verify(&payload, &snapshot.signature)
    {
        return Err(SecsyncError::SnapshotSignatureInvalid);
    }

    if let Some(parent) = parent {
        let expected_proof =
            create_parent_snapshot_proof(&parent.ciphertext, &parent.parent_snapshot_proof);
        if expected_proof != snapshot.public_data.parent_snapshot_proof {
            return Err(SecsyncError::SnapshotProofMismatch);
        }
    }

    if snapshot.public_data.doc_id != doc_id {
        return Err(SecsyncError::SnapshotDocIdMismatch);
    }

    if let Some(known_clocks) = known_update_clocks {
        for (author, local_clock) in known_clocks {
            match snapshot
                .public_data
                .parent_snapshot_update_clocks
                .get(author)
            {
                Some(recorded) if recorded >= local_clock => {}
                // The snapshot was taken without having observed updates the
                // local client already applied.
                _ => return Err(SecsyncError::SnapshotMissesUpdates),
            }
        }
    }

    let nonce = decode_nonce(&snapshot.nonce).ok_or(SecsyncError::SnapshotDecryptionFailed)?;
    let ciphertext =
        from_base64(&snapshot.ciphertext).map_err(|_| SecsyncError::SnapshotDecryptionFailed)?;

    open(key, &ciphertext, nonce, public_data_encoded.as_bytes())
        .map_err(|_| SecsyncError::SnapshotDecryptionFailed)
}

pub(crate) fn decode_nonce(encoded: &str) -> Option<AeadNonce> {
    let bytes = from_base64(encoded).ok()?;
    bytes.as_slice().try_into().ok()
}

#[derive(Debug, Error)]
pub enum CreateSnapshotError {
    #[error("public data could not be canonicalized: {0}")]
    Canonicalize(#[from] CanonicalizeError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}
