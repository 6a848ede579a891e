//! Destination allow-list
//!
//! Server-side policy restricting which true destinations the relay will
//! splice to. Patterns are either an exact host or `*.suffix`, where the
//! wildcard matches one or more labels beneath the suffix but never the
//! bare suffix itself. Candidates are passed through IDNA to-Unicode
//! before matching; anything that fails the decode matches nothing.

use serde::{Deserialize, Serialize};

/// Ordered set of destination patterns
///
/// Matching is order-independent: a candidate is allowed when any pattern
/// accepts it, and denied by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowList {
    patterns: Vec<String>,
}

impl AllowList {
    /// Build an allow-list from patterns
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// The configured patterns
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether the candidate host is an allowed destination
    pub fn matches(&self, host: &str) -> bool {
        let (unicode, validity) = idna::domain_to_unicode(host);
        if validity.is_err() {
            return false;
        }

        self.patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, &unicode))
    }
}

/// Whether a single pattern accepts the (already IDNA-decoded) candidate
fn pattern_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // The tail must match including the label separator, which also
        // rules out the bare suffix (it is shorter than ".suffix").
        let tail = &pattern[1..];
        host.ends_with(tail) && !suffix.is_empty() && host.len() > tail.len()
    } else {
        pattern == host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let list = AllowList::new(["upstream.test"]);
        assert!(list.matches("upstream.test"));
        assert!(!list.matches("other.test"));
        assert!(!list.matches("sub.upstream.test"));
    }

    #[test]
    fn test_wildcard_matches_subdomains() {
        let list = AllowList::new(["*.permitted.test"]);
        assert!(list.matches("a.permitted.test"));
        assert!(list.matches("deep.a.permitted.test"));
    }

    #[test]
    fn test_wildcard_rejects_bare_suffix() {
        let list = AllowList::new(["*.permitted.test"]);
        assert!(!list.matches("permitted.test"));
    }

    #[test]
    fn test_wildcard_rejects_suffix_without_dot() {
        let list = AllowList::new(["*.example.com"]);
        assert!(!list.matches("badexample.com"));
    }

    #[test]
    fn test_wildcard_rejects_suffix_prefix() {
        let list = AllowList::new(["*.permitted.test"]);
        assert!(!list.matches("permitted.test.evil"));
    }

    #[test]
    fn test_default_deny() {
        let list = AllowList::default();
        assert!(!list.matches("anything.test"));
    }

    #[test]
    fn test_multiple_patterns() {
        let list = AllowList::new(["exact.test", "*.wild.test"]);
        assert!(list.matches("exact.test"));
        assert!(list.matches("a.wild.test"));
        assert!(!list.matches("wild.test"));
        assert!(!list.matches("exact.test.evil"));
    }

    #[test]
    fn test_idna_decoded_candidate_matches_unicode_pattern() {
        // Punycode form of bücher.example decodes to the Unicode pattern.
        let list = AllowList::new(["bücher.example"]);
        assert!(list.matches("xn--bcher-kva.example"));
        assert!(list.matches("bücher.example"));
    }

    #[test]
    fn test_invalid_idna_never_matches() {
        let list = AllowList::new(["*.test", "xn--"]);
        // An invalid punycode label fails the decode and matches nothing.
        assert!(!list.matches("xn--\u{fffd}.test"));
    }

    #[test]
    fn test_bare_star_dot_pattern_matches_nothing_spurious() {
        let list = AllowList::new(["*."]);
        assert!(!list.matches("host.test"));
    }
}
