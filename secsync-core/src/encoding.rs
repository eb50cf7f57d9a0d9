// SPDX-License-Identifier: MIT OR Apache-2.0

//! base64url (unpadded) helpers and random id generation.
//!
//! All binary fields of the wire envelopes are base64url-encoded without
//! padding; ids (documents, snapshots, ephemeral sessions) are 24 random
//! bytes in the same encoding.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Length in bytes of generated ids and ephemeral session ids.
pub const ID_LEN: usize = 24;

/// Encode bytes as an unpadded base64url string.
pub fn to_base64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode an unpadded base64url string.
pub fn from_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value)
}

/// Generate a fresh random id: 24 bytes from the operating system's
/// randomness, base64url-encoded.
pub fn generate_id() -> String {
    to_base64(&generate_id_bytes())
}

/// Generate the raw 24 random bytes of an id.
pub fn generate_id_bytes() -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Helper method for `serde` to serialize bytes into an unpadded base64url
/// string.
pub fn serialize_base64<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&to_base64(value))
}

/// Helper method for `serde` to deserialize an unpadded base64url string
/// into bytes.
pub fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = <String as serde::Deserialize>::deserialize(deserializer)?;
    from_base64(&value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::{from_base64, generate_id, to_base64, ID_LEN};

    #[test]
    fn base64_roundtrip() {
        let bytes = [7u8, 255, 0, 42, 1];
        assert_eq!(from_base64(&to_base64(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn no_padding() {
        // 24 bytes encode to 32 characters without trailing '='.
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('='));
        assert_eq!(from_base64(&id).unwrap().len(), ID_LEN);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
