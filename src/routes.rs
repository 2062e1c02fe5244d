//! Route predicate deciding which requests belong to the functions runtime

use regex::Regex;

/// Compiled set of route patterns.
///
/// A path matches when any pattern matches it; a single pattern behaves as a
/// one-element set. Patterns are unanchored unless they anchor themselves, so
/// `^/api/` is usually what you want.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    patterns: Vec<Regex>,
}

impl RouteMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Test a raw request path (path plus optional query)
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
