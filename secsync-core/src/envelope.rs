// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared plumbing for the three envelope kinds.
//!
//! Snapshots, updates and ephemeral messages all carry the same outer shape:
//! AEAD ciphertext, nonce, a detached signature and public data. The
//! canonical encoding of the public data (base64url-encoded) serves as AEAD
//! associated data, and the signature covers the canonical JSON of
//! `{"ciphertext", "nonce", "publicData"}` so that no field can be swapped
//! independently.
use serde::Serialize;
use serde_json::json;

use crate::canonical::{canonicalize, CanonicalizeError};
use crate::encoding::to_base64;

/// The base64url-encoded canonical form of an envelope's public data.
pub(crate) fn encode_public_data<T: Serialize>(
    public_data: &T,
) -> Result<String, CanonicalizeError> {
    Ok(to_base64(canonicalize(public_data)?.as_bytes()))
}

/// The exact bytes signed by the author of an envelope.
pub(crate) fn signed_payload(
    nonce: &str,
    ciphertext: &str,
    public_data: &str,
) -> Result<Vec<u8>, CanonicalizeError> {
    let payload = canonicalize(&json!({
        "nonce": nonce,
        "ciphertext": ciphertext,
        "publicData": public_data,
    }))?;
    Ok(payload.into_bytes())
}
