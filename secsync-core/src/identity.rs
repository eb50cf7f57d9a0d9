// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 key pairs and detached signatures.
//!
//! Every snapshot, update and ephemeral message carries a detached signature
//! by its author. Authors are identified by their public key on the wire.
use std::fmt;
use std::hash::Hash as StdHash;
use std::str::FromStr;

use ed25519_dalek::{Signer, Verifier, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

use crate::encoding::{deserialize_base64, serialize_base64, to_base64};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Ed25519 signing key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new signing key from the operating system's randomness.
    pub fn new() -> Self {
        let mut csprng: OsRng = OsRng;
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    pub fn from_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.0.to_bytes()
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Sign the given bytes, returning a detached signature.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal secret key material when printing debug info.
        f.debug_tuple("PrivateKey").field(&"***").finish()
    }
}

/// Ed25519 verifying key identifying an author.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.0.as_bytes()
    }

    /// Verify a detached signature over the given bytes.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, &signature.0).is_ok()
    }

    /// base64url (unpadded) representation, the form used on the wire and as
    /// per-author map key.
    pub fn to_base64(&self) -> String {
        to_base64(self.as_bytes())
    }
}

impl StdHash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            value.try_into().map_err(|_| IdentityError::InvalidLength)?;
        Self::from_bytes(&bytes)
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = crate::encoding::from_base64(value).map_err(|_| IdentityError::InvalidLength)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base64()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_base64(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_base64(deserializer)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|err: IdentityError| serde::de::Error::custom(err.to_string()))
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LENGTH]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; SIGNATURE_LENGTH] =
            value.try_into().map_err(|_| IdentityError::InvalidLength)?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&to_base64(&self.to_bytes()))
            .finish()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_base64(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_base64(deserializer)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|err: IdentityError| serde::de::Error::custom(err.to_string()))
    }
}

/// Error types for key and signature material.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Invalid number of bytes for a key or signature.
    #[error("invalid number of bytes for key or signature")]
    InvalidLength,

    /// Bytes do not form a valid Ed25519 public key.
    #[error("bytes are not a valid public key")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use super::{PrivateKey, PublicKey, Signature};

    #[test]
    fn sign_and_verify() {
        let private_key = PrivateKey::new();
        let public_key = private_key.public_key();

        let signature = private_key.sign(b"Hello, secsync!");
        assert!(public_key.verify(b"Hello, secsync!", &signature));
        assert!(!public_key.verify(b"Hello, Eve!", &signature));
    }

    #[test]
    fn wrong_key_fails() {
        let private_key = PrivateKey::new();
        let other_public_key = PrivateKey::new().public_key();

        let signature = private_key.sign(b"Hello, secsync!");
        assert!(!other_public_key.verify(b"Hello, secsync!", &signature));
    }

    #[test]
    fn base64_roundtrip() {
        let public_key = PrivateKey::new().public_key();
        let parsed: PublicKey = public_key.to_base64().parse().unwrap();
        assert_eq!(public_key, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let private_key = PrivateKey::new();
        let public_key = private_key.public_key();
        let signature = private_key.sign(b"payload");

        let json = serde_json::to_string(&public_key).unwrap();
        let public_key_again: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(public_key, public_key_again);

        let json = serde_json::to_string(&signature).unwrap();
        let signature_again: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(signature, signature_again);
    }
}
