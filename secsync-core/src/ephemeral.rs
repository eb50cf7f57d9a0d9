// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ephemeral ("awareness") messages and their session protocol.
//!
//! Ephemeral messages are never persisted. Replay protection works through
//! per-process sessions: every client starts a random 24-byte session id
//! with a monotonic counter and only accepts messages from peers whose
//! session it has verified through a signed proof. The proof signs the
//! concatenation of the addressee's and the prover's session ids, so it
//! cannot be replayed towards a different peer or a later session.
//!
//! Plaintext layout inside the AEAD:
//! `[messageType:1][sessionId:24][sessionCounter:4 big-endian][body]`.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aead::{open, random_nonce, seal, AeadKey};
use crate::encoding::{from_base64, generate_id_bytes, to_base64, ID_LEN};
use crate::envelope::{encode_public_data, signed_payload};
use crate::error::SecsyncError;
use crate::identity::{PrivateKey, PublicKey, Signature};
use crate::snapshot::decode_nonce;

/// Length of the fixed plaintext header.
const HEADER_LEN: usize = 1 + ID_LEN + 4;

/// Discriminator byte at the start of every ephemeral plaintext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EphemeralMessageType {
    Initialize,
    Proof,
    ProofAndRequestProof,
    Message,
}

impl EphemeralMessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            EphemeralMessageType::Initialize => 0,
            EphemeralMessageType::Proof => 1,
            EphemeralMessageType::ProofAndRequestProof => 2,
            EphemeralMessageType::Message => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EphemeralMessageType::Initialize),
            1 => Some(EphemeralMessageType::Proof),
            2 => Some(EphemeralMessageType::ProofAndRequestProof),
            3 => Some(EphemeralMessageType::Message),
            _ => None,
        }
    }
}

/// Public (unencrypted but authenticated) fields of an ephemeral message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPublicData {
    pub doc_id: String,
    pub pub_key: PublicKey,
}

/// A complete ephemeral message envelope as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralMessage {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: Signature,
    pub public_data: EphemeralPublicData,
}

/// A peer's session as far as we have verified it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerSession {
    pub session_id: [u8; ID_LEN],
    pub session_counter: u32,
}

/// Per-process, per-document ephemeral session state.
///
/// A fresh session is started on every (re)connect; peers have to prove
/// their sessions again before their messages are accepted.
#[derive(Clone, Debug)]
pub struct EphemeralSession {
    pub id: [u8; ID_LEN],
    pub counter: u32,
    pub valid_sessions: HashMap<PublicKey, PeerSession>,
}

impl EphemeralSession {
    pub fn new() -> Self {
        Self {
            id: generate_id_bytes(),
            counter: 0,
            valid_sessions: HashMap::new(),
        }
    }
}

impl Default for EphemeralSession {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after successfully processing an incoming ephemeral message.
#[derive(Clone, Debug, Default)]
pub struct EphemeralMessageOutcome {
    /// Decrypted application payload, only set for `message` frames.
    pub content: Option<Vec<u8>>,
    /// A proof envelope to send back to the peers.
    pub proof: Option<EphemeralMessage>,
    /// True when the produced proof also requests one in return.
    pub request_proof: bool,
}

/// A failed verification, possibly still carrying a proof to send so the
/// sender can re-establish a session with us.
#[derive(Debug)]
pub struct EphemeralVerifyError {
    pub error: SecsyncError,
    pub proof: Option<EphemeralMessage>,
}

impl From<SecsyncError> for EphemeralVerifyError {
    fn from(error: SecsyncError) -> Self {
        Self { error, proof: None }
    }
}

/// Sign the session proof a prover sends to `remote_session_id`.
pub fn create_ephemeral_session_proof(
    remote_session_id: &[u8; ID_LEN],
    own_session_id: &[u8; ID_LEN],
    signing_key: &PrivateKey,
) -> Signature {
    let mut bytes = Vec::with_capacity(2 * ID_LEN);
    bytes.extend_from_slice(remote_session_id);
    bytes.extend_from_slice(own_session_id);
    signing_key.sign(&bytes)
}

/// Verify a session proof received from `remote_session_id`, addressed to
/// `own_session_id`.
pub fn verify_ephemeral_session_proof(
    proof: &Signature,
    own_session_id: &[u8; ID_LEN],
    remote_session_id: &[u8; ID_LEN],
    author_public_key: &PublicKey,
) -> bool {
    let mut bytes = Vec::with_capacity(2 * ID_LEN);
    bytes.extend_from_slice(own_session_id);
    bytes.extend_from_slice(remote_session_id);
    author_public_key.verify(&bytes, proof)
}

/// Assemble, encrypt and sign an ephemeral message, advancing the session
/// counter.
pub fn create_ephemeral_message(
    body: &[u8],
    message_type: EphemeralMessageType,
    session: &mut EphemeralSession,
    doc_id: &str,
    key: &AeadKey,
    signing_key: &PrivateKey,
) -> Result<EphemeralMessage, SecsyncError> {
    create_with_type_byte(body, message_type.to_byte(), session, doc_id, key, signing_key)
}

fn create_with_type_byte(
    body: &[u8],
    type_byte: u8,
    session: &mut EphemeralSession,
    doc_id: &str,
    key: &AeadKey,
    signing_key: &PrivateKey,
) -> Result<EphemeralMessage, SecsyncError> {
    let mut plaintext = Vec::with_capacity(HEADER_LEN + body.len());
    plaintext.push(type_byte);
    plaintext.extend_from_slice(&session.id);
    plaintext.extend_from_slice(&session.counter.to_be_bytes());
    plaintext.extend_from_slice(body);

    let public_data = EphemeralPublicData {
        doc_id: doc_id.to_string(),
        pub_key: signing_key.public_key(),
    };
    let public_data_encoded =
        encode_public_data(&public_data).map_err(|_| SecsyncError::EphemeralUnexpected)?;

    let nonce = random_nonce();
    let ciphertext = seal(key, &plaintext, nonce, public_data_encoded.as_bytes())
        .map_err(|_| SecsyncError::EphemeralUnexpected)?;

    let nonce_encoded = to_base64(&nonce);
    let ciphertext_encoded = to_base64(&ciphertext);
    let payload = signed_payload(&nonce_encoded, &ciphertext_encoded, &public_data_encoded)
        .map_err(|_| SecsyncError::EphemeralUnexpected)?;
    let signature = signing_key.sign(&payload);

    session.counter += 1;

    Ok(EphemeralMessage {
        ciphertext: ciphertext_encoded,
        nonce: nonce_encoded,
        signature,
        public_data,
    })
}

/// Create a proof envelope addressed to `remote_session_id`.
fn create_proof_message(
    remote_session_id: &[u8; ID_LEN],
    message_type: EphemeralMessageType,
    session: &mut EphemeralSession,
    doc_id: &str,
    key: &AeadKey,
    signing_key: &PrivateKey,
) -> Result<EphemeralMessage, SecsyncError> {
    let proof = create_ephemeral_session_proof(remote_session_id, &session.id, signing_key);
    create_ephemeral_message(
        &proof.to_bytes(),
        message_type,
        session,
        doc_id,
        key,
        signing_key,
    )
}

/// Verify and decrypt an incoming ephemeral message, deciding the protocol
/// action per message type.
pub fn verify_and_decrypt_ephemeral_message<F>(
    message: &EphemeralMessage,
    key: &AeadKey,
    doc_id: &str,
    session: &mut EphemeralSession,
    signing_key: &PrivateKey,
    is_valid_client: F,
) -> Result<EphemeralMessageOutcome, EphemeralVerifyError>
where
    F: Fn(&PublicKey) -> bool,
{
    if message.public_data.doc_id != doc_id {
        return Err(SecsyncError::EphemeralDocIdMismatch.into());
    }

    let sender = message.public_data.pub_key;
    if !is_valid_client(&sender) {
        return Err(SecsyncError::EphemeralInvalidClient.into());
    }

    let public_data_encoded = encode_public_data(&message.public_data)
        .map_err(|_| SecsyncError::EphemeralUnexpected)?;
    let payload = signed_payload(&message.nonce, &message.ciphertext, &public_data_encoded)
        .map_err(|_| SecsyncError::EphemeralUnexpected)?;
    if !sender.verify(&payload, &message.signature) {
        return Err(SecsyncError::EphemeralSignatureInvalid.into());
    }

    let nonce = decode_nonce(&message.nonce).ok_or(SecsyncError::EphemeralDecryptionFailed)?;
    let ciphertext =
        from_base64(&message.ciphertext).map_err(|_| SecsyncError::EphemeralDecryptionFailed)?;
    let plaintext = open(key, &ciphertext, nonce, public_data_encoded.as_bytes())
        .map_err(|_| SecsyncError::EphemeralDecryptionFailed)?;

    if plaintext.len() < HEADER_LEN {
        return Err(SecsyncError::EphemeralUnexpected.into());
    }

    let message_type =
        EphemeralMessageType::from_byte(plaintext[0]).ok_or(SecsyncError::EphemeralUnknownType)?;
    let sender_session_id: [u8; ID_LEN] = plaintext[1..1 + ID_LEN]
        .try_into()
        .map_err(|_| SecsyncError::EphemeralUnexpected)?;
    let sender_counter = u32::from_be_bytes(
        plaintext[1 + ID_LEN..HEADER_LEN]
            .try_into()
            .map_err(|_| SecsyncError::EphemeralUnexpected)?,
    );
    let body = &plaintext[HEADER_LEN..];

    match message_type {
        EphemeralMessageType::Initialize => {
            let proof = create_proof_message(
                &sender_session_id,
                EphemeralMessageType::ProofAndRequestProof,
                session,
                doc_id,
                key,
                signing_key,
            )?;
            Ok(EphemeralMessageOutcome {
                content: None,
                proof: Some(proof),
                request_proof: true,
            })
        }
        EphemeralMessageType::Proof | EphemeralMessageType::ProofAndRequestProof => {
            let proof_signature: Signature = body
                .try_into()
                .map_err(|_| SecsyncError::EphemeralSignatureInvalid)?;
            if !verify_ephemeral_session_proof(
                &proof_signature,
                &session.id,
                &sender_session_id,
                &sender,
            ) {
                return Err(SecsyncError::EphemeralSignatureInvalid.into());
            }

            session.valid_sessions.insert(
                sender,
                PeerSession {
                    session_id: sender_session_id,
                    session_counter: sender_counter,
                },
            );

            let proof = if message_type == EphemeralMessageType::ProofAndRequestProof {
                Some(create_proof_message(
                    &sender_session_id,
                    EphemeralMessageType::Proof,
                    session,
                    doc_id,
                    key,
                    signing_key,
                )?)
            } else {
                None
            };

            Ok(EphemeralMessageOutcome {
                content: None,
                proof,
                request_proof: false,
            })
        }
        EphemeralMessageType::Message => {
            let session_known = matches!(
                session.valid_sessions.get(&sender),
                Some(peer) if peer.session_id == sender_session_id
            );
            if !session_known {
                // Unknown or outdated session: ask the sender to prove
                // theirs while proving ours.
                let proof = create_proof_message(
                    &sender_session_id,
                    EphemeralMessageType::ProofAndRequestProof,
                    session,
                    doc_id,
                    key,
                    signing_key,
                )?;
                return Err(EphemeralVerifyError {
                    error: SecsyncError::EphemeralNoValidSession,
                    proof: Some(proof),
                });
            }

            if let Some(peer) = session.valid_sessions.get_mut(&sender) {
                if peer.session_counter >= sender_counter {
                    return Err(SecsyncError::EphemeralReplay.into());
                }
                peer.session_counter = sender_counter;
            }

            Ok(EphemeralMessageOutcome {
                content: Some(body.to_vec()),
                proof: None,
                request_proof: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::error::SecsyncError;
    use crate::identity::PrivateKey;
    use crate::test_utils::{test_key, TEST_DOC_ID};

    use super::{
        create_ephemeral_message, create_with_type_byte, verify_and_decrypt_ephemeral_message,
        EphemeralMessageType, EphemeralSession,
    };

    struct Peer {
        signing_key: PrivateKey,
        session: EphemeralSession,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                signing_key: PrivateKey::new(),
                session: EphemeralSession::new(),
            }
        }
    }

    /// Run the proof handshake so `receiver` accepts messages from `sender`.
    fn establish_session(sender: &mut Peer, receiver: &mut Peer) {
        let key = test_key();

        let initialize = create_ephemeral_message(
            &[],
            EphemeralMessageType::Initialize,
            &mut sender.session,
            TEST_DOC_ID,
            &key,
            &sender.signing_key,
        )
        .unwrap();

        // Receiver answers with proof + request-proof.
        let outcome = verify_and_decrypt_ephemeral_message(
            &initialize,
            &key,
            TEST_DOC_ID,
            &mut receiver.session,
            &receiver.signing_key,
            |_| true,
        )
        .unwrap();
        assert!(outcome.request_proof);
        let receiver_proof = outcome.proof.unwrap();

        // Sender verifies the receiver's proof and proves back.
        let outcome = verify_and_decrypt_ephemeral_message(
            &receiver_proof,
            &key,
            TEST_DOC_ID,
            &mut sender.session,
            &sender.signing_key,
            |_| true,
        )
        .unwrap();
        let sender_proof = outcome.proof.unwrap();

        // Receiver stores the sender's now proven session.
        let outcome = verify_and_decrypt_ephemeral_message(
            &sender_proof,
            &key,
            TEST_DOC_ID,
            &mut receiver.session,
            &receiver.signing_key,
            |_| true,
        )
        .unwrap();
        assert!(outcome.proof.is_none());
        assert!(receiver
            .session
            .valid_sessions
            .contains_key(&sender.signing_key.public_key()));
    }

    #[test]
    fn handshake_and_message() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        establish_session(&mut alice, &mut bob);

        let message = create_ephemeral_message(
            &[22],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let outcome = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap();
        assert_eq!(outcome.content, Some(vec![22]));
    }

    #[test]
    fn replay_is_rejected_once_applied() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        establish_session(&mut alice, &mut bob);

        let message = create_ephemeral_message(
            &[22],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let outcome = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap();
        assert_eq!(outcome.content, Some(vec![22]));

        // The identical envelope again: exactly one replay error, nothing
        // applied twice.
        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralReplay);
        assert!(error.proof.is_none());
    }

    #[test]
    fn message_without_session_requests_proof() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let message = create_ephemeral_message(
            &[1, 2, 3],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralNoValidSession);
        assert!(error.proof.is_some());
    }

    #[test]
    fn stale_session_id_requests_proof() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        establish_session(&mut alice, &mut bob);

        // Alice restarts with a fresh session without proving it.
        alice.session = EphemeralSession::new();
        let message = create_ephemeral_message(
            &[4],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralNoValidSession);
    }

    #[test]
    fn doc_id_mismatch() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let message = create_ephemeral_message(
            &[],
            EphemeralMessageType::Initialize,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            "other-doc",
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralDocIdMismatch);
    }

    #[test]
    fn invalid_client_is_rejected() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let message = create_ephemeral_message(
            &[],
            EphemeralMessageType::Initialize,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| false,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralInvalidClient);
    }

    #[test]
    fn unknown_message_type() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let message = create_with_type_byte(
            &[],
            77,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralUnknownType);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let message = create_ephemeral_message(
            &[],
            EphemeralMessageType::Initialize,
            &mut alice.session,
            TEST_DOC_ID,
            &test_key(),
            &alice.signing_key,
        )
        .unwrap();

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &[5; 32],
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralDecryptionFailed);
    }

    #[test]
    fn tampered_envelope_signature() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();

        let mut message = create_ephemeral_message(
            &[],
            EphemeralMessageType::Initialize,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();
        message.signature = alice.signing_key.sign(b"unrelated");

        let error = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap_err();
        assert_eq!(error.error, SecsyncError::EphemeralSignatureInvalid);
    }

    #[test]
    fn counters_strictly_increase_with_gaps_allowed() {
        let key = test_key();
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        establish_session(&mut alice, &mut bob);

        // Skip a counter value by authoring a message no one receives.
        let _lost = create_ephemeral_message(
            &[0],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let message = create_ephemeral_message(
            &[1],
            EphemeralMessageType::Message,
            &mut alice.session,
            TEST_DOC_ID,
            &key,
            &alice.signing_key,
        )
        .unwrap();

        let outcome = verify_and_decrypt_ephemeral_message(
            &message,
            &key,
            TEST_DOC_ID,
            &mut bob.session,
            &bob.signing_key,
            |_| true,
        )
        .unwrap();
        assert_eq!(outcome.content, Some(vec![1]));

        // The skipped (older) message arrives late: counter not strictly
        // greater, rejected.
        assert_matches!(
            verify_and_decrypt_ephemeral_message(
                &_lost,
                &key,
                TEST_DOC_ID,
                &mut bob.session,
                &bob.signing_key,
                |_| true,
            ),
            Err(error) => assert_eq!(error.error, SecsyncError::EphemeralReplay)
        );
    }
}
