//! Content fingerprints.
//!
//! Values are hashed through their canonical `serde_json` encoding (object
//! keys are sorted because `serde_json::Map` is a `BTreeMap` without the
//! `preserve_order` feature), so equal values always hash equally.

use serde::Serialize;

use crate::Result;

/// Hex-encoded blake3 digest of a serializable value.
///
/// # Errors
/// `Serialization` if the value cannot be encoded.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(fingerprint_bytes(&bytes))
}

/// Hex-encoded blake3 digest of raw bytes.
#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
