// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content digests for the snapshot proof chain.
//!
//! A snapshot commits to its ancestry through a BLAKE3 digest over the
//! parent's ciphertext and the grandparent's proof. Nothing here is secret;
//! the digest only has to be collision resistant and cheap to recompute on
//! every verification.
use std::fmt;

use crate::encoding::to_base64;

/// Digest size in bytes.
pub const HASH_LEN: usize = blake3::OUT_LEN;

/// A BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Digest a single byte slice.
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self::over(&[bytes.as_ref()])
    }

    /// Digest a sequence of segments as if they were one concatenated
    /// input, without building the concatenation.
    pub fn over(segments: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for segment in segments {
            hasher.update(segment);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The digest in the encoding proofs use on the wire.
    pub fn to_base64(&self) -> String {
        to_base64(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}
