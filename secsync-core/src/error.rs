// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol error taxonomy.
//!
//! Every verification or decryption failure maps onto a stable
//! `SECSYNC_ERROR_*` code shared across implementations. The codes carry no
//! cryptographic detail; clients keep them on their context for
//! observability.
use thiserror::Error;

/// Tagged protocol errors with stable codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecsyncError {
    /// The snapshot's parent proof does not match the recomputed hash chain.
    #[error("SECSYNC_ERROR_101 parent snapshot proof does not match")]
    SnapshotProofMismatch,

    /// The snapshot's recorded update clocks are behind locally applied
    /// updates, meaning the snapshot silently dropped updates.
    #[error("SECSYNC_ERROR_102 snapshot is missing already applied updates")]
    SnapshotMissesUpdates,

    /// The snapshot was created for a different document.
    #[error("SECSYNC_ERROR_103 snapshot document id does not match")]
    SnapshotDocIdMismatch,

    /// The snapshot signature does not verify against the author key.
    #[error("SECSYNC_ERROR_110 snapshot signature invalid")]
    SnapshotSignatureInvalid,

    /// The snapshot ciphertext could not be decrypted.
    #[error("SECSYNC_ERROR_111 snapshot decryption failed")]
    SnapshotDecryptionFailed,

    /// An ephemeral message could not be decrypted.
    #[error("SECSYNC_ERROR_21 ephemeral message decryption failed")]
    EphemeralDecryptionFailed,

    /// An ephemeral message arrived without a verified session for its
    /// sender.
    #[error("SECSYNC_ERROR_22 no verified session for sender")]
    EphemeralNoValidSession,

    /// An ephemeral message counter did not strictly increase.
    #[error("SECSYNC_ERROR_23 ephemeral message replay detected")]
    EphemeralReplay,

    /// The host rejected the sender's public key.
    #[error("SECSYNC_ERROR_24 sender is not a valid client")]
    EphemeralInvalidClient,

    /// Unknown ephemeral message type byte.
    #[error("SECSYNC_ERROR_25 unknown ephemeral message type")]
    EphemeralUnknownType,

    /// The ephemeral message was created for a different document.
    #[error("SECSYNC_ERROR_26 ephemeral document id does not match")]
    EphemeralDocIdMismatch,

    /// Any unexpected failure while handling an ephemeral message.
    #[error("SECSYNC_ERROR_36 unexpected error during ephemeral handling")]
    EphemeralUnexpected,

    /// The ephemeral envelope or session proof signature is invalid.
    #[error("SECSYNC_ERROR_38 ephemeral signature invalid")]
    EphemeralSignatureInvalid,

    /// The update signature or AEAD tag is invalid. The two cases are not
    /// distinguished externally.
    #[error("SECSYNC_ERROR_212 update signature or decryption failed")]
    UpdateSignatureOrDecryptionFailed,

    /// The update references a snapshot other than the active one.
    #[error("SECSYNC_ERROR_213 update references wrong active snapshot")]
    UpdateWrongSnapshot,

    /// The update clock is not exactly the expected successor.
    #[error("SECSYNC_ERROR_214 update clock is not the expected value")]
    UpdateClockMismatch,
}

impl SecsyncError {
    /// The stable code string, e.g. `SECSYNC_ERROR_214`.
    pub fn code(&self) -> &'static str {
        match self {
            SecsyncError::SnapshotProofMismatch => "SECSYNC_ERROR_101",
            SecsyncError::SnapshotMissesUpdates => "SECSYNC_ERROR_102",
            SecsyncError::SnapshotDocIdMismatch => "SECSYNC_ERROR_103",
            SecsyncError::SnapshotSignatureInvalid => "SECSYNC_ERROR_110",
            SecsyncError::SnapshotDecryptionFailed => "SECSYNC_ERROR_111",
            SecsyncError::EphemeralDecryptionFailed => "SECSYNC_ERROR_21",
            SecsyncError::EphemeralNoValidSession => "SECSYNC_ERROR_22",
            SecsyncError::EphemeralReplay => "SECSYNC_ERROR_23",
            SecsyncError::EphemeralInvalidClient => "SECSYNC_ERROR_24",
            SecsyncError::EphemeralUnknownType => "SECSYNC_ERROR_25",
            SecsyncError::EphemeralDocIdMismatch => "SECSYNC_ERROR_26",
            SecsyncError::EphemeralUnexpected => "SECSYNC_ERROR_36",
            SecsyncError::EphemeralSignatureInvalid => "SECSYNC_ERROR_38",
            SecsyncError::UpdateSignatureOrDecryptionFailed => "SECSYNC_ERROR_212",
            SecsyncError::UpdateWrongSnapshot => "SECSYNC_ERROR_213",
            SecsyncError::UpdateClockMismatch => "SECSYNC_ERROR_214",
        }
    }

    /// True for errors in the snapshot verification family (101..199).
    pub fn is_snapshot_error(&self) -> bool {
        matches!(
            self,
            SecsyncError::SnapshotProofMismatch
                | SecsyncError::SnapshotMissesUpdates
                | SecsyncError::SnapshotDocIdMismatch
                | SecsyncError::SnapshotSignatureInvalid
                | SecsyncError::SnapshotDecryptionFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SecsyncError;

    #[test]
    fn display_leads_with_code() {
        let error = SecsyncError::UpdateClockMismatch;
        assert!(error.to_string().starts_with(error.code()));
    }

    #[test]
    fn snapshot_family() {
        assert!(SecsyncError::SnapshotProofMismatch.is_snapshot_error());
        assert!(!SecsyncError::UpdateClockMismatch.is_snapshot_error());
    }
}
