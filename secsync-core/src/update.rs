// SPDX-License-Identifier: MIT OR Apache-2.0

//! Update envelopes: authenticated-encrypted incremental changes anchored to
//! a snapshot.
//!
//! Every author keeps a monotonic clock per snapshot. The first update an
//! author sends against a snapshot carries clock 0, each subsequent one is
//! exactly the predecessor plus one. Receivers reject anything else, which
//! makes replays and reordering detectable without server trust.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aead::{open, random_nonce, seal, AeadError, AeadKey};
use crate::canonical::CanonicalizeError;
use crate::encoding::{from_base64, to_base64};
use crate::envelope::{encode_public_data, signed_payload};
use crate::error::SecsyncError;
use crate::identity::{PrivateKey, PublicKey, Signature};
use crate::snapshot::decode_nonce;

/// Public (unencrypted but authenticated) fields of an update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePublicData {
    pub ref_snapshot_id: String,
    pub doc_id: String,
    pub pub_key: PublicKey,
    /// Per-author monotonic counter against `ref_snapshot_id`, starting at 0.
    #[serde(default)]
    pub clock: u64,
}

/// Ordering information the server attaches when delivering an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerData {
    pub version: u64,
}

/// A complete update envelope as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: Signature,
    pub public_data: UpdatePublicData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<UpdateServerData>,
}

/// Result of verifying an incoming update.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The update verified and decrypted; apply `content` and advance the
    /// author's clock to `clock`.
    Applied { content: Vec<u8>, clock: u64 },
    /// The update is not an error but must not be applied, e.g. it was
    /// authored by the local client or its clock is already covered.
    Ignored,
}

/// Encrypt and sign an update with the given clock value.
pub fn create_update(
    content: &[u8],
    mut public_data: UpdatePublicData,
    key: &AeadKey,
    signing_key: &PrivateKey,
    clock: u64,
) -> Result<Update, CreateUpdateError> {
    public_data.clock = clock;

    let public_data_encoded = encode_public_data(&public_data)?;
    let nonce = random_nonce();
    let ciphertext = seal(key, content, nonce, public_data_encoded.as_bytes())?;

    let nonce_encoded = to_base64(&nonce);
    let ciphertext_encoded = to_base64(&ciphertext);
    let payload = signed_payload(&nonce_encoded, &ciphertext_encoded, &public_data_encoded)?;
    let signature = signing_key.sign(&payload);

    Ok(Update {
        ciphertext: ciphertext_encoded,
        nonce: nonce_encoded,
        signature,
        public_data,
        server_data: None,
    })
}

/// Verify an update envelope and decrypt its change payload.
///
/// `current_clock` is the author's last applied clock against the active
/// snapshot, `-1` when no update of theirs has been applied yet. The update
/// is accepted only when its clock is exactly `current_clock + 1`.
///
/// With `skip_if_current_clock_is_higher` an update whose clock is already
/// covered yields [`UpdateOutcome::Ignored`] instead of an error; with
/// `skip_if_authored_by_current_client` the same applies to the client's own
/// updates echoed back by the server.
#[allow(clippy::too_many_arguments)]
pub fn verify_and_decrypt_update(
    update: &Update,
    key: &AeadKey,
    current_active_snapshot_id: &str,
    author_public_key: &PublicKey,
    current_clock: i64,
    skip_if_current_clock_is_higher: bool,
    skip_if_authored_by_current_client: bool,
    current_client_public_key: &PublicKey,
) -> Result<UpdateOutcome, SecsyncError> {
    if skip_if_authored_by_current_client && &update.public_data.pub_key == current_client_public_key
    {
        return Ok(UpdateOutcome::Ignored);
    }

    let public_data_encoded = encode_public_data(&update.public_data)
        .map_err(|_| SecsyncError::UpdateSignatureOrDecryptionFailed)?;
    let payload = signed_payload(&update.nonce, &update.ciphertext, &public_data_encoded)
        .map_err(|_| SecsyncError::UpdateSignatureOrDecryptionFailed)?;

    // Signature and AEAD failures share one code on purpose; receivers must
    // not be able to distinguish them externally.
    if update.public_data.pub_key != *author_public_key
        || !author_public_key.verify(&payload, &update.signature)
    {
        return Err(SecsyncError::UpdateSignatureOrDecryptionFailed);
    }

    if update.public_data.ref_snapshot_id != current_active_snapshot_id {
        return Err(SecsyncError::UpdateWrongSnapshot);
    }

    if skip_if_current_clock_is_higher && (update.public_data.clock as i64) <= current_clock {
        return Ok(UpdateOutcome::Ignored);
    }

    if update.public_data.clock as i64 != current_clock + 1 {
        return Err(SecsyncError::UpdateClockMismatch);
    }

    let nonce = decode_nonce(&update.nonce).ok_or(SecsyncError::UpdateSignatureOrDecryptionFailed)?;
    let ciphertext = from_base64(&update.ciphertext)
        .map_err(|_| SecsyncError::UpdateSignatureOrDecryptionFailed)?;
    let content = open(key, &ciphertext, nonce, public_data_encoded.as_bytes())
        .map_err(|_| SecsyncError::UpdateSignatureOrDecryptionFailed)?;

    Ok(UpdateOutcome::Applied {
        content,
        clock: update.public_data.clock,
    })
}

#[derive(Debug, Error)]
pub enum CreateUpdateError {
    #[error("public data could not be canonicalized: {0}")]
    Canonicalize(#[from] CanonicalizeError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::error::SecsyncError;
    use crate::identity::PrivateKey;
    use crate::test_utils::{test_key, TEST_DOC_ID};

    use super::{create_update, verify_and_decrypt_update, UpdateOutcome, UpdatePublicData};

    const SNAPSHOT_ID: &str = "JWnYF1ffjDhzVWiJKYrYaDqDGYtMm4Wy";

    fn public_data(signing_key: &PrivateKey) -> UpdatePublicData {
        UpdatePublicData {
            ref_snapshot_id: SNAPSHOT_ID.to_string(),
            doc_id: TEST_DOC_ID.to_string(),
            pub_key: signing_key.public_key(),
            clock: 0,
        }
    }

    #[test]
    fn create_and_verify() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();
        let reader = PrivateKey::new().public_key();

        let update =
            create_update(b"Hello World", public_data(&signing_key), &key, &signing_key, 10)
                .unwrap();
        assert_eq!(update.public_data.clock, 10);

        let outcome = verify_and_decrypt_update(
            &update, &key, SNAPSHOT_ID, &author, 9, false, false, &reader,
        )
        .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                content: b"Hello World".to_vec(),
                clock: 10
            }
        );
    }

    #[test]
    fn clock_must_be_exact_successor() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();
        let reader = PrivateKey::new().public_key();

        let update =
            create_update(b"Hello World", public_data(&signing_key), &key, &signing_key, 10)
                .unwrap();

        // Already applied.
        assert_matches!(
            verify_and_decrypt_update(&update, &key, SNAPSHOT_ID, &author, 10, false, false, &reader),
            Err(SecsyncError::UpdateClockMismatch)
        );

        // Gap.
        assert_matches!(
            verify_and_decrypt_update(&update, &key, SNAPSHOT_ID, &author, 8, false, false, &reader),
            Err(SecsyncError::UpdateClockMismatch)
        );
    }

    #[test]
    fn wrong_snapshot_reference() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();
        let reader = PrivateKey::new().public_key();

        let update =
            create_update(b"Hello World", public_data(&signing_key), &key, &signing_key, 0)
                .unwrap();

        assert_matches!(
            verify_and_decrypt_update(
                &update,
                &key,
                "somethingelse",
                &author,
                -1,
                false,
                false,
                &reader
            ),
            Err(SecsyncError::UpdateWrongSnapshot)
        );
    }

    #[test]
    fn tampering_is_detected() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();
        let reader = PrivateKey::new().public_key();

        let update =
            create_update(b"Hello World", public_data(&signing_key), &key, &signing_key, 0)
                .unwrap();

        let mut tampered = update.clone();
        tampered.public_data.clock = 1;
        assert_matches!(
            verify_and_decrypt_update(&tampered, &key, SNAPSHOT_ID, &author, 0, false, false, &reader),
            Err(SecsyncError::UpdateSignatureOrDecryptionFailed)
        );

        let mut tampered = update.clone();
        let replacement = if tampered.ciphertext.starts_with('A') { "B" } else { "A" };
        tampered.ciphertext = format!("{replacement}{}", &tampered.ciphertext[1..]);
        assert_matches!(
            verify_and_decrypt_update(&tampered, &key, SNAPSHOT_ID, &author, -1, false, false, &reader),
            Err(SecsyncError::UpdateSignatureOrDecryptionFailed)
        );

        // Claimed author differs from the signing author.
        let impostor = PrivateKey::new().public_key();
        assert_matches!(
            verify_and_decrypt_update(&update, &key, SNAPSHOT_ID, &impostor, -1, false, false, &reader),
            Err(SecsyncError::UpdateSignatureOrDecryptionFailed)
        );
    }

    #[test]
    fn skip_flags() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();

        let update =
            create_update(b"Hello World", public_data(&signing_key), &key, &signing_key, 2)
                .unwrap();

        // Own update echoed back by the server.
        assert_eq!(
            verify_and_decrypt_update(&update, &key, SNAPSHOT_ID, &author, 5, false, true, &author)
                .unwrap(),
            UpdateOutcome::Ignored
        );

        // Clock already covered while catching up.
        let reader = PrivateKey::new().public_key();
        assert_eq!(
            verify_and_decrypt_update(&update, &key, SNAPSHOT_ID, &author, 2, true, false, &reader)
                .unwrap(),
            UpdateOutcome::Ignored
        );
    }

    #[test]
    fn clock_sequence_from_zero() {
        let key = test_key();
        let signing_key = PrivateKey::new();
        let author = signing_key.public_key();
        let reader = PrivateKey::new().public_key();

        let mut current_clock: i64 = -1;
        for clock in 0..4u64 {
            let update = create_update(
                format!("change {clock}").as_bytes(),
                public_data(&signing_key),
                &key,
                &signing_key,
                clock,
            )
            .unwrap();

            let outcome = verify_and_decrypt_update(
                &update,
                &key,
                SNAPSHOT_ID,
                &author,
                current_clock,
                false,
                false,
                &reader,
            )
            .unwrap();
            assert_matches!(outcome, UpdateOutcome::Applied { clock: applied, .. } => {
                assert_eq!(applied, clock);
            });
            current_clock = clock as i64;
        }
    }
}
