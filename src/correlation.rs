//! Pulls the application-level correlation id out of a raw payload.
//!
//! The lookup is a pattern match for `"<field>": "<value>"`, not a parse. It
//! avoids deserializing large bodies just to read one field, with known
//! limits: the first occurrence wins wherever it is nested, there is no
//! schema awareness, and a value containing an escaped quote is cut at that
//! quote.

use std::sync::LazyLock;

use regex::bytes::Regex;

/// Field looked up when no alias is configured.
pub const DEFAULT_FIELD: &str = "request_id";

static DEFAULT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&pattern_for(DEFAULT_FIELD)).expect("invalid default pattern"));

/// The value is matched byte-wise so invalid UTF-8 inside it still matches.
fn pattern_for(field: &str) -> String {
    format!(r#""{}":\s*"((?-u:.)*?)""#, regex::escape(field))
}

/// Extractor compiled once for a configured field alias.
#[derive(Debug, Clone)]
pub struct CorrelationExtractor {
    pattern: Regex,
}

impl Default for CorrelationExtractor {
    fn default() -> Self {
        CorrelationExtractor {
            pattern: DEFAULT_PATTERN.clone(),
        }
    }
}

impl CorrelationExtractor {
    /// An empty alias behaves like no alias.
    pub fn new(alias: Option<&str>) -> Self {
        let Some(alias) = alias.filter(|a| !a.is_empty()) else {
            return Self::default();
        };

        match Regex::new(&pattern_for(alias)) {
            Ok(pattern) => CorrelationExtractor {
                pattern,
            },
            Err(error) => {
                tracing::warn!(%alias, %error, "unusable correlation id alias, using default field");
                Self::default()
            }
        }
    }

    /// Returns the first matching value, or an empty string.
    pub fn extract(&self, payload: &[u8]) -> String {
        self.pattern
            .captures(payload)
            .and_then(|captures| captures.get(1))
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default()
    }
}

/// One-off extraction; prefer a long-lived [`CorrelationExtractor`] on hot paths.
pub fn extract(payload: &[u8], alias: Option<&str>) -> String {
    CorrelationExtractor::new(alias).extract(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_field() {
        assert_eq!(extract(br#"{"request_id":"abc123"}"#, None), "abc123");
        assert_eq!(extract(br#"{"a": 1, "request_id":  "r-2"}"#, Some("")), "r-2");
    }

    #[test]
    fn aliased_field() {
        assert_eq!(extract(br#"{"trace_ref":"xyz"}"#, Some("trace_ref")), "xyz");
        assert_eq!(extract(br#"{"request_id":"abc"}"#, Some("trace_ref")), "");
    }

    #[test]
    fn no_match_is_empty() {
        assert_eq!(extract(br#"{"other":"value"}"#, None), "");
        assert_eq!(extract(b"not json at all", None), "");
        assert_eq!(extract(b"", None), "");
    }

    #[test]
    fn first_match_wins_regardless_of_nesting() {
        let payload = br#"{"inner":{"request_id":"nested"},"request_id":"outer"}"#;
        assert_eq!(extract(payload, None), "nested");
    }

    #[test]
    fn escaped_quote_truncates_value() {
        let payload = br#"{"request_id":"ab\"cd"}"#;
        assert_eq!(extract(payload, None), r"ab\");
    }

    #[test]
    fn alias_is_matched_literally() {
        let extractor = CorrelationExtractor::new(Some("ref.id"));
        assert_eq!(extractor.extract(br#"{"refXid":"no"}"#), "");
        assert_eq!(extractor.extract(br#"{"ref.id":"yes"}"#), "yes");
    }

    #[test]
    fn invalid_utf8_value_is_replaced() {
        let payload = b"{\"request_id\":\"ab\xffcd\"}";
        assert_eq!(extract(payload, None), "ab\u{fffd}cd");
    }

    #[test]
    fn non_string_value_is_not_matched() {
        assert_eq!(extract(br#"{"request_id":12345}"#, None), "");
    }
}
