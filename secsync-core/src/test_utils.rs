// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed keys and ids shared across the test suites.
use crate::aead::AeadKey;

pub const TEST_DOC_ID: &str = "6e46c006-5541-11ec-bf63-0242ac130002";

/// Deterministic 32-byte document key.
pub fn test_key() -> AeadKey {
    let bytes =
        hex::decode("724b092810ec86d7e35c9d067702b31ef90bc43a7b598626749914d6a3e033ed").unwrap();
    bytes.as_slice().try_into().unwrap()
}
