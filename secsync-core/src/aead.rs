// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated encryption for envelope payloads.
//!
//! Every snapshot, update and ephemeral message body is sealed with
//! XChaCha20-Poly1305 under a fresh 24-byte nonce. The envelope's canonical
//! public data is always bound as associated data, so a payload cannot be
//! moved under different public data without failing authentication.
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// 256-bit envelope key, handed in by the host's key distribution layer.
pub type AeadKey = [u8; 32];

/// 24-byte nonce, generated fresh per envelope and shipped inside it.
pub type AeadNonce = [u8; 24];

/// Draw a fresh nonce from the operating system's randomness.
pub fn random_nonce() -> AeadNonce {
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seal an envelope payload, binding `aad` into the authentication tag.
pub fn seal(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Seal)
}

/// Open a sealed payload. Fails when the key, nonce, ciphertext or
/// associated data do not match what was sealed.
pub fn open(
    key: &AeadKey,
    ciphertext: &[u8],
    nonce: AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Open)
}

#[derive(Debug, Error)]
pub enum AeadError {
    /// The payload could not be sealed.
    #[error("envelope payload could not be sealed")]
    Seal,

    /// Authentication or decryption failed. Deliberately carries no detail
    /// about which.
    #[error("envelope payload failed authentication")]
    Open,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{open, random_nonce, seal, AeadError, AeadKey};

    #[test]
    fn seal_and_open() {
        let key: AeadKey = [7; 32];
        let nonce = random_nonce();

        let sealed = seal(&key, b"Hello, secsync!", nonce, b"public data").unwrap();
        let opened = open(&key, &sealed, nonce, b"public data").unwrap();

        assert_eq!(opened, b"Hello, secsync!");
    }

    #[test]
    fn open_rejects_any_mismatch() {
        let key: AeadKey = [7; 32];
        let nonce = random_nonce();
        let sealed = seal(&key, b"Hello, secsync!", nonce, b"public data").unwrap();

        // Wrong key.
        assert_matches!(
            open(&[8; 32], &sealed, nonce, b"public data"),
            Err(AeadError::Open)
        );

        // Wrong nonce.
        assert_matches!(
            open(&key, &sealed, random_nonce(), b"public data"),
            Err(AeadError::Open)
        );

        // Wrong associated data.
        assert_matches!(
            open(&key, &sealed, nonce, b"other public data"),
            Err(AeadError::Open)
        );

        // Flipped ciphertext bit.
        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_matches!(
            open(&key, &tampered, nonce, b"public data"),
            Err(AeadError::Open)
        );
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
