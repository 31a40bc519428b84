//! Topic and channel URI handling
//!
//! URIs are matched byte-exactly; there is no normalization. Embedded NUL
//! or ASCII control bytes are rejected, as are over-long URIs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KernelError;
use crate::limits::MAX_URI_LEN;

/// Validates a topic or channel URI.
///
/// Rejects empty URIs, URIs longer than `MAX_URI_LEN`, and URIs
/// containing NUL or other ASCII control bytes.
pub fn validate_uri(uri: &str) -> Result<(), KernelError> {
    if uri.is_empty() {
        return Err(KernelError::Invalid("empty URI".to_string()));
    }
    if uri.len() > MAX_URI_LEN {
        return Err(KernelError::Invalid(format!(
            "URI length {} exceeds {}",
            uri.len(),
            MAX_URI_LEN
        )));
    }
    if uri.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(KernelError::Invalid("URI contains control bytes".to_string()));
    }
    Ok(())
}

/// A validated topic URI.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic, validating the URI rules.
    pub fn new(uri: impl Into<String>) -> Result<Self, KernelError> {
        let uri = uri.into();
        validate_uri(&uri)?;
        Ok(Self(uri))
    }

    /// Returns the topic string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Byte-exact prefix test, used by cursor filters.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.as_bytes().starts_with(prefix.as_bytes())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_uris() {
        assert!(validate_uri("filament/time/set").is_ok());
        assert!(validate_uri("a").is_ok());
        assert!(validate_uri("sensor/θ").is_ok());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(validate_uri(""), Err(KernelError::Invalid(_))));
    }

    #[test]
    fn test_rejects_control_bytes() {
        assert!(validate_uri("a\0b").is_err());
        assert!(validate_uri("a\nb").is_err());
        assert!(validate_uri("a\x1bb").is_err());
        assert!(validate_uri("a\x7fb").is_err());
    }

    #[test]
    fn test_rejects_overlong() {
        let long = "x".repeat(MAX_URI_LEN + 1);
        assert!(validate_uri(&long).is_err());
        let max = "x".repeat(MAX_URI_LEN);
        assert!(validate_uri(&max).is_ok());
    }

    #[test]
    fn test_topic_prefix_is_byte_exact() {
        let topic = Topic::new("filament/chan/7").unwrap();
        assert!(topic.has_prefix("filament/chan/"));
        assert!(!topic.has_prefix("Filament/chan/"));
    }
}
