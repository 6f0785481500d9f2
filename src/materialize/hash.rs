//! Content hashing for materialized records.
//!
//! The hash covers the serialized payload and provenance. Two instances
//! materializing the same source row produce the same hash, which lets an
//! operator confirm that a race wrote identical content.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute a SHA256 hash of a serializable value.
///
/// The value is first serialized to JSON, then hashed.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
