//! Wildcard matching of routing tags.
//!
//! Patterns only understand `*` (any run of characters, possibly empty). Literal parts are
//! matched greedily left to right, which is sufficient for a single-level wildcard language
//! and needs no backtracking.

/// Returns true when `tag` matches `pattern`.
///
/// An empty pattern only matches an empty tag; `*` matches everything.
pub fn matches(tag: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return tag == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !tag.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match tag[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }

    // The suffix may not reuse characters already consumed by earlier parts.
    tag.len() - pos >= last.len() && tag[pos..].ends_with(last)
}

/// A compiled-once tag pattern held by filters and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatcher {
    pattern: String,
}

impl TagMatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, tag: &str) -> bool {
        matches(tag, &self.pattern)
    }
}

impl Default for TagMatcher {
    fn default() -> Self {
        Self::new("*")
    }
}
