//! Hashing utilities for dynconf
//!
//! BLAKE3 over the canonical JSON encoding of a configuration is what
//! nodes record at prepare time and re-check at commit and load time.

use crate::applicator::NodeContext;
use crate::Result;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Hash of a configuration's canonical encoding.
///
/// `NodeContext` only holds ordered maps and vectors, so serde_json
/// output is stable for equal values.
pub fn config_hash(config: &NodeContext) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    Ok(blake3_hash(&bytes))
}
