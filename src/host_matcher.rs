//! Allow- and deny-lists of host patterns.

use std::fs;
use std::path::Path;

use crate::glob_trie::GlobTrie;
use crate::Error;

/// A compiled list of hostname glob patterns.
///
/// Matching is case-insensitive. A pattern such as `*.example.com` matches
/// every subdomain of `example.com` but not `example.com` itself; list both
/// if both are wanted.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    trie: GlobTrie,
}

impl HostMatcher {
    /// Build a matcher from patterns. Surrounding whitespace is trimmed and
    /// blank entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trie`] if the trie cannot be built.
    pub fn new<I, S>(patterns: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut trie = GlobTrie::new(true);
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            trie.add_path(pattern)?;
        }
        Ok(Self { trie })
    }

    /// Build a matcher from a list, or `None` when the list is empty.
    pub fn from_list(patterns: &[String]) -> Result<Option<Self>, Error> {
        let matcher = Self::new(patterns)?;
        Ok((!matcher.is_empty()).then_some(matcher))
    }

    /// Does `host` match any pattern?
    pub fn matches(&self, host: &str) -> bool {
        self.trie.check_path(host)
    }

    /// Number of patterns in the list.
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

/// Read patterns from a file: one per line, `#` starts a comment.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read.
pub fn load_patterns(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(parse_patterns(&content))
}

fn parse_patterns(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_matches_case_insensitive() {
        let m = HostMatcher::new(["*.Internal.Example.org", "evil.com"]).unwrap();
        assert!(m.matches("iphone.internal.example.org"));
        assert!(m.matches("EVIL.COM"));
        assert!(!m.matches("example.org"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_blank_entries_skipped() {
        let m = HostMatcher::new(["", "  ", " a.com "]).unwrap();
        assert_eq!(m.len(), 1);
        assert!(m.matches("a.com"));
    }

    #[test]
    fn test_from_list_empty_is_none() {
        assert!(HostMatcher::from_list(&[]).unwrap().is_none());
        assert!(HostMatcher::from_list(&["".to_string()]).unwrap().is_none());
        assert!(HostMatcher::from_list(&["a.com".to_string()]).unwrap().is_some());
    }

    #[test]
    fn test_parse_patterns_comments() {
        let patterns = parse_patterns("# deny list\n*.internal\n\nlocalhost.me  # rebinding\n");
        assert_eq!(patterns, vec!["*.internal", "localhost.me"]);
    }

    #[test]
    fn test_load_patterns_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "*.example.com").unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "cdn.example.net").unwrap();

        let patterns = load_patterns(file.path()).unwrap();
        assert_eq!(patterns, vec!["*.example.com", "cdn.example.net"]);
    }

    #[test]
    fn test_load_patterns_missing_file() {
        assert!(matches!(
            load_patterns("/nonexistent/media-jail/patterns"),
            Err(Error::Io(_))
        ));
    }
}
