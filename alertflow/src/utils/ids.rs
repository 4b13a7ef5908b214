//! Identifier and natural-key helpers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a time-ordered record identifier.
#[must_use]
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

/// Hashes key components into a stable, prefixed natural key.
///
/// Components are joined with `:` before hashing, so the same inputs always
/// produce the same key on every runner.
#[must_use]
pub fn natural_key(prefix: &str, components: &[&str]) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("{prefix}:{}", hex::encode(&result[..16]))
}
