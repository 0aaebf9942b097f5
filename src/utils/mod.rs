//! Utility functions and helpers

pub mod retry;

use regex::Regex;
use sha2::{Digest, Sha256};

pub use retry::RetryConfig;

/// Regex for validating descriptor and service names.
/// Names must start with a letter or underscore, followed by letters, numbers, underscores, or hyphens
pub static VALID_NAME_REGEX: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]*$").unwrap());

/// Hex-encoded SHA-256 of the given bytes.
pub fn sha256_hex(content: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(content.as_ref()))
}
