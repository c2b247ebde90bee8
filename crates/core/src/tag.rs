use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LegacyTagMode, TimestampNs};

/// Separator between the timestamp prefix and the tag body on the wire.
pub const TAG_TS_SEPARATOR: char = '|';

/// Namespaces the engine itself interprets. Everything else is opaque to the
/// core and owned by the application layer.
pub const NS_PARENT: &str = "parent";
pub const NS_CONTENT: &str = "content";
pub const TAG_CHUNK_TYPE: &str = "type:chunk";
pub const TAG_DELETED: &str = "status:deleted";

/// Prefix of the hidden tag that tracks content versions for as-of reads.
/// These tags are stored like any other but stripped from user projections.
pub const CONTENT_VERSION_PREFIX: &str = "content:version:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("empty tag body")]
    Empty,

    #[error("tag body has no namespace separator: {0}")]
    MissingNamespace(String),

    #[error("tag body contains reserved separator: {0}")]
    ReservedSeparator(String),

    #[error("unparseable timestamp prefix: {0}")]
    BadTimestamp(String),

    #[error("legacy timestamp form rejected in strict mode: {0}")]
    LegacyForm(String),
}

/// A timestamped tag.
///
/// The wire and disk form is `T|ns:key:value` with `T` an unsigned 64-bit
/// nanosecond timestamp. In memory the two halves are kept apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub ts: TimestampNs,
    pub body: String,
}

impl Tag {
    pub fn new(ts: TimestampNs, body: impl Into<String>) -> Self {
        Self {
            ts,
            body: body.into(),
        }
    }

    /// Validates a bare tag body as supplied by callers (no timestamp).
    pub fn validate_body(body: &str) -> Result<(), TagError> {
        if body.is_empty() {
            return Err(TagError::Empty);
        }

        if body.contains(TAG_TS_SEPARATOR) {
            return Err(TagError::ReservedSeparator(body.to_string()));
        }

        if !body.contains(':') {
            return Err(TagError::MissingNamespace(body.to_string()));
        }

        Ok(())
    }

    /// Parses the wire form `T|ns:key:value`.
    ///
    /// In [`LegacyTagMode::Normalize`] an RFC 3339 timestamp prefix (a relic
    /// of older files) is converted to nanoseconds; strict mode rejects it.
    pub fn parse_wire(wire: &str, mode: LegacyTagMode) -> Result<Self, TagError> {
        let (prefix, body) = wire
            .split_once(TAG_TS_SEPARATOR)
            .ok_or_else(|| TagError::BadTimestamp(wire.to_string()))?;

        Self::validate_body(body)?;

        if let Ok(ts) = prefix.parse::<u64>() {
            return Ok(Tag::new(ts, body));
        }

        match mode {
            LegacyTagMode::Strict => Err(TagError::LegacyForm(wire.to_string())),
            LegacyTagMode::Normalize => {
                let parsed = chrono::DateTime::parse_from_rfc3339(prefix)
                    .map_err(|_| TagError::BadTimestamp(wire.to_string()))?;

                let ts = parsed
                    .timestamp_nanos_opt()
                    .filter(|ns| *ns >= 0)
                    .ok_or_else(|| TagError::BadTimestamp(wire.to_string()))?;

                Ok(Tag::new(ts as u64, body))
            }
        }
    }

    pub fn wire(&self) -> String {
        format!("{}{}{}", self.ts, TAG_TS_SEPARATOR, self.body)
    }

    /// Namespace prefix, everything before the first colon.
    pub fn namespace(&self) -> &str {
        self.body.split(':').next().unwrap_or(&self.body)
    }

    /// The `ns:key` prefix used for diff classification: everything before
    /// the last colon. A two-segment tag like `status:active` yields `status`.
    pub fn ns_key(&self) -> &str {
        match self.body.rfind(':') {
            Some(idx) => &self.body[..idx],
            None => &self.body,
        }
    }

    /// The value part, everything after the last colon.
    pub fn value(&self) -> &str {
        match self.body.rfind(':') {
            Some(idx) => &self.body[idx + 1..],
            None => "",
        }
    }

    /// Hidden tags are engine bookkeeping, never surfaced to callers.
    pub fn is_hidden(&self) -> bool {
        self.body.starts_with(CONTENT_VERSION_PREFIX)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.ts, TAG_TS_SEPARATOR, self.body)
    }
}

/// Splits a tag body into its `ns:key` prefix and value at the last colon.
pub fn split_ns_key(body: &str) -> (&str, &str) {
    match body.rfind(':') {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => (body, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let tag = Tag::new(1_700_000_000_000_000_123, "type:document");
        let wire = tag.wire();
        assert_eq!(wire, "1700000000000000123|type:document");

        let back = Tag::parse_wire(&wire, LegacyTagMode::Strict).unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn body_validation() {
        assert_eq!(Tag::validate_body(""), Err(TagError::Empty));
        assert!(matches!(
            Tag::validate_body("nocolon"),
            Err(TagError::MissingNamespace(_))
        ));
        assert!(matches!(
            Tag::validate_body("a|b:c"),
            Err(TagError::ReservedSeparator(_))
        ));
        assert!(Tag::validate_body("status:active").is_ok());
        assert!(Tag::validate_body("content:checksum:sha256:abcd").is_ok());
    }

    #[test]
    fn ns_key_splits_at_last_colon() {
        let tag = Tag::new(1, "status:published");
        assert_eq!(tag.ns_key(), "status");
        assert_eq!(tag.value(), "published");

        let tag = Tag::new(1, "content:chunk-size:4194304");
        assert_eq!(tag.ns_key(), "content:chunk-size");
        assert_eq!(tag.value(), "4194304");
    }

    #[test]
    fn strict_mode_rejects_iso_prefix() {
        let wire = "2023-11-14T12:00:00Z|status:active";
        assert!(matches!(
            Tag::parse_wire(wire, LegacyTagMode::Strict),
            Err(TagError::LegacyForm(_))
        ));
    }

    #[test]
    fn normalize_mode_converts_iso_prefix() {
        let wire = "2023-11-14T12:00:00Z|status:active";
        let tag = Tag::parse_wire(wire, LegacyTagMode::Normalize).unwrap();
        assert_eq!(tag.body, "status:active");
        assert_eq!(tag.ts, 1_699_963_200_000_000_000);
    }

    #[test]
    fn hidden_tags_are_flagged() {
        assert!(Tag::new(1, "content:version:99").is_hidden());
        assert!(!Tag::new(1, "content:size:5").is_hidden());
    }
}
