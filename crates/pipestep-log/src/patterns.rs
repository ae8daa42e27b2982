//! Matching of known error signatures in log output.

use pipestep_types::ErrorPattern;
use regex::Regex;

struct CompiledPattern {
    regex: Option<Regex>,
    pattern: ErrorPattern,
}

/// Matches messages against a step's declared error patterns.
///
/// A pattern that is not a valid regex is matched as a plain substring.
#[derive(Default)]
pub struct ErrorPatternMatcher {
    patterns: Vec<CompiledPattern>,
}

impl ErrorPatternMatcher {
    pub fn new(patterns: &[ErrorPattern]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| CompiledPattern {
                regex: Regex::new(&p.pattern).ok(),
                pattern: p.clone(),
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern matching `message`, if any.
    pub fn find(&self, message: &str) -> Option<&ErrorPattern> {
        let normalized = message.trim();
        self.patterns
            .iter()
            .find(|p| match &p.regex {
                Some(regex) => regex.is_match(normalized),
                None => normalized.contains(p.pattern.pattern.trim()),
            })
            .map(|p| &p.pattern)
    }
}

impl std::fmt::Debug for ErrorPatternMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPatternMatcher")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}
