//! Character-level trie with `*` globbing.
//!
//! Patterns are ASCII strings in which `*` matches a run of zero or more
//! arbitrary characters. Every pattern is inserted once at startup; after
//! that the trie is only read, so a built trie can be shared between any
//! number of concurrent requests without locking.
//!
//! Nodes live in an arena and refer to their children by index. Each child
//! is owned by exactly one parent, so the structure is a tree.
//!
//! Matching walks the candidate one byte at a time. When a node has a
//! wildcard child the remainder of the candidate is first offered to the
//! wildcard, which scans forward and retries normal descent from every
//! position where its successor character appears. This is linear-amortized
//! for a single wildcard followed by a discriminating character, but a
//! candidate with long ambiguous runs against several wildcards can cost
//! quadratic time.

use std::collections::HashMap;

use crate::Error;

const ROOT: usize = 0;

/// Edge label. The wildcard has its own variant so it can never collide
/// with a literal byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Char(u8),
    Glob,
}

#[derive(Debug, Clone)]
struct Node {
    key: Key,
    children: HashMap<Key, usize>,
    /// Sole child, set only while `children.len() == 1`.
    one_shot: Option<usize>,
    is_glob: bool,
    /// A pattern ends here, even if longer patterns continue through.
    can_match: bool,
    has_glob_child: bool,
}

impl Node {
    fn new(key: Key) -> Self {
        Self {
            key,
            children: HashMap::new(),
            one_shot: None,
            is_glob: key == Key::Glob,
            can_match: false,
            has_glob_child: false,
        }
    }
}

/// A set of glob patterns compiled into a trie.
///
/// # Example
///
/// ```rust
/// use media_jail::GlobTrie;
///
/// let mut trie = GlobTrie::new(true);
/// trie.add_path("*.example.com").unwrap();
/// trie.add_path("image/*").unwrap();
///
/// assert!(trie.check_path("cdn.EXAMPLE.com"));
/// assert!(trie.check_path("image/png"));
/// assert!(!trie.check_path("example.org"));
/// ```
#[derive(Debug, Clone)]
pub struct GlobTrie {
    nodes: Vec<Node>,
    icase: bool,
    patterns: usize,
}

impl GlobTrie {
    /// Create an empty trie. With `icase` set, ASCII letters are folded to
    /// lowercase on insertion and on lookup.
    pub fn new(icase: bool) -> Self {
        Self {
            nodes: vec![Node::new(Key::Char(0))],
            icase,
            patterns: 0,
        }
    }

    /// Number of patterns inserted so far.
    pub fn len(&self) -> usize {
        self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }

    /// Insert a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trie`] if the walk reaches a node index that is not
    /// in the arena. The trie is left with whatever prefix was inserted
    /// before the failure and must not be used.
    pub fn add_path(&mut self, pattern: &str) -> Result<(), Error> {
        let mut cur = ROOT;

        for &b in pattern.as_bytes() {
            let key = self.key_for(b);

            let existing = self.node(cur)?.children.get(&key).copied();
            let child = match existing {
                Some(id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(Node::new(key));
                    self.node_mut(cur)?.children.insert(key, id);
                    id
                }
            };

            let node = self.node_mut(cur)?;
            node.one_shot = if node.children.len() == 1 {
                Some(child)
            } else {
                None
            };
            if key == Key::Glob {
                node.has_glob_child = true;
            }

            cur = child;
        }

        self.node_mut(cur)?.can_match = true;
        self.patterns += 1;
        Ok(())
    }

    /// Check whether `candidate` matches any inserted pattern.
    pub fn check_path(&self, candidate: &str) -> bool {
        self.check_from(ROOT, candidate.as_bytes(), 0)
    }

    fn check_from(&self, start: usize, s: &[u8], index: usize) -> bool {
        let mut cur = &self.nodes[start];

        for i in index..s.len() {
            let c = self.fold(s[i]);

            // a wildcard can also match zero characters, so offer it the
            // current position before consuming anything
            if cur.has_glob_child {
                if let Some(&glob) = cur.children.get(&Key::Glob) {
                    if self.glob_consume(glob, s, i) {
                        return true;
                    }
                }
            }

            if let Some(only) = cur.one_shot {
                let next = &self.nodes[only];
                match next.key {
                    Key::Char(k) if k == c => {
                        cur = next;
                        continue;
                    }
                    // the only child was the wildcard and it already failed,
                    // or the single literal differs
                    _ => return false,
                }
            }

            match cur.children.get(&Key::Char(c)) {
                Some(&id) => cur = &self.nodes[id],
                None => return false,
            }
        }

        cur.can_match || cur.is_glob || self.glob_accepts_empty(cur)
    }

    /// Consume a run of characters with the wildcard at `glob`, starting at
    /// `index`, and try to resume normal descent after it.
    fn glob_consume(&self, glob: usize, s: &[u8], index: usize) -> bool {
        let node = &self.nodes[glob];

        // nothing follows the wildcard, it swallows the rest
        if node.can_match {
            return true;
        }

        // consecutive wildcards
        if node.has_glob_child {
            if let Some(&next) = node.children.get(&Key::Glob) {
                if self.glob_consume(next, s, index) {
                    return true;
                }
            }
        }

        let expected = node.one_shot.map(|id| self.nodes[id].key);

        for i in index..s.len() {
            let c = self.fold(s[i]);

            // single successor: skip until it shows up
            if let Some(key) = expected {
                if key != Key::Char(c) {
                    continue;
                }
            }

            if let Some(&id) = node.children.get(&Key::Char(c)) {
                if self.check_from(id, s, i + 1) {
                    return true;
                }
            }
        }

        false
    }

    /// A trailing wildcard that was never entered still matches zero characters.
    fn glob_accepts_empty(&self, node: &Node) -> bool {
        if !node.has_glob_child {
            return false;
        }
        match node.children.get(&Key::Glob) {
            Some(&id) => {
                let glob = &self.nodes[id];
                glob.can_match || self.glob_accepts_empty(glob)
            }
            None => false,
        }
    }

    fn key_for(&self, b: u8) -> Key {
        if b == b'*' {
            Key::Glob
        } else {
            Key::Char(self.fold(b))
        }
    }

    fn fold(&self, b: u8) -> u8 {
        if self.icase {
            b.to_ascii_lowercase()
        } else {
            b
        }
    }

    fn node(&self, id: usize) -> Result<&Node, Error> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::Trie(format!("node {} missing from arena", id)))
    }

    fn node_mut(&mut self, id: usize) -> Result<&mut Node, Error> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::Trie(format!("node {} missing from arena", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(icase: bool, patterns: &[&str]) -> GlobTrie {
        let mut t = GlobTrie::new(icase);
        for p in patterns {
            t.add_path(p).unwrap();
        }
        t
    }

    // ==================== Literal patterns ====================

    #[test]
    fn test_exact_match() {
        let t = trie(false, &["example.com"]);
        assert!(t.check_path("example.com"));
        assert!(!t.check_path("example.co"));
        assert!(!t.check_path("example.com.au"));
        assert!(!t.check_path(""));
    }

    #[test]
    fn test_shared_prefix_short_and_long() {
        let t = trie(false, &["/foo/bar", "/foo"]);
        assert!(t.check_path("/foo"));
        assert!(t.check_path("/foo/bar"));
        assert!(!t.check_path("/foo/"));
        assert!(!t.check_path("/foo/ba"));
    }

    #[test]
    fn test_empty_trie_matches_nothing() {
        let t = GlobTrie::new(true);
        assert!(t.is_empty());
        assert!(!t.check_path("anything"));
        assert!(!t.check_path(""));
    }

    #[test]
    fn test_empty_pattern_matches_empty_candidate() {
        let t = trie(false, &[""]);
        assert!(t.check_path(""));
        assert!(!t.check_path("a"));
    }

    // ==================== Wildcards ====================

    #[test]
    fn test_trailing_glob_zero_width() {
        let t = trie(false, &["/static/*"]);
        assert!(t.check_path("/static/"));
        assert!(t.check_path("/static/logo.png"));
        assert!(t.check_path("/static/a/b/c"));
        assert!(!t.check_path("/static"));
    }

    #[test]
    fn test_leading_glob() {
        let t = trie(false, &["*.example.com"]);
        assert!(t.check_path("www.example.com"));
        assert!(t.check_path("a.b.example.com"));
        assert!(t.check_path(".example.com"));
        assert!(!t.check_path("example.com"));
        assert!(!t.check_path("www.example.org"));
        assert!(!t.check_path("www.example.com.evil.org"));
    }

    #[test]
    fn test_inner_glob() {
        let t = trie(false, &["/foo/*/bar"]);
        assert!(t.check_path("/foo/x/bar"));
        assert!(t.check_path("/foo//bar"));
        assert!(t.check_path("/foo/x/y/bar"));
        assert!(!t.check_path("/foo/x/baz"));
        assert!(!t.check_path("/foo/x/bar/"));
    }

    #[test]
    fn test_glob_retries_after_false_start() {
        // the first 'b' after the wildcard is a dead end, the second is not
        let t = trie(false, &["a*bc"]);
        assert!(t.check_path("abxbc"));
        assert!(t.check_path("abbc"));
        assert!(t.check_path("abc"));
        assert!(!t.check_path("abcx"));
        assert!(!t.check_path("ab"));
    }

    #[test]
    fn test_glob_with_multiple_successors() {
        let t = trie(false, &["img*.png", "img*.gif"]);
        assert!(t.check_path("img1.png"));
        assert!(t.check_path("img-large.gif"));
        assert!(!t.check_path("img1.jpg"));
    }

    #[test]
    fn test_consecutive_globs() {
        let t = trie(false, &["a**b"]);
        assert!(t.check_path("ab"));
        assert!(t.check_path("axxb"));
        assert!(!t.check_path("axx"));
    }

    #[test]
    fn test_bare_glob_matches_everything() {
        let t = trie(false, &["*"]);
        assert!(t.check_path(""));
        assert!(t.check_path("anything at all"));
    }

    #[test]
    fn test_glob_alongside_literal_sibling() {
        let t = trie(false, &["foo*", "foobar.com"]);
        assert!(t.check_path("foo"));
        assert!(t.check_path("foobar.com"));
        assert!(t.check_path("foozzz"));
        assert!(!t.check_path("fo"));
    }

    #[test]
    fn test_multiple_globs() {
        let t = trie(false, &["*.cdn.*.net"]);
        assert!(t.check_path("a.cdn.b.net"));
        assert!(t.check_path("x.y.cdn.region.net"));
        assert!(!t.check_path("a.cdn.b.org"));
    }

    // ==================== Case folding ====================

    #[test]
    fn test_case_insensitive_insert_upper() {
        let t = trie(true, &["Example.COM"]);
        assert!(t.check_path("example.com"));
        assert!(t.check_path("EXAMPLE.com"));
    }

    #[test]
    fn test_case_insensitive_query_upper() {
        let t = trie(true, &["example.com"]);
        assert!(t.check_path("Example.COM"));
    }

    #[test]
    fn test_case_insensitive_glob() {
        let t = trie(true, &["IMAGE/*"]);
        assert!(t.check_path("image/PNG"));
        assert!(t.check_path("Image/svg+xml"));
    }

    #[test]
    fn test_case_sensitive_rejects_mismatch() {
        let t = trie(false, &["Example.COM"]);
        assert!(t.check_path("Example.COM"));
        assert!(!t.check_path("example.com"));

        let t = trie(false, &["example.com"]);
        assert!(!t.check_path("Example.COM"));
    }

    // ==================== Structure ====================

    #[test]
    fn test_one_shot_tracks_single_child() {
        let mut t = GlobTrie::new(false);
        t.add_path("ab").unwrap();
        assert_eq!(t.nodes[ROOT].one_shot, Some(1));

        t.add_path("ac").unwrap();
        let a = t.nodes[ROOT].children[&Key::Char(b'a')];
        assert_eq!(t.nodes[a].one_shot, None);
        assert_eq!(t.nodes[a].children.len(), 2);

        t.add_path("ab").unwrap();
        assert_eq!(t.nodes[a].one_shot, None);
    }

    #[test]
    fn test_glob_flags() {
        let t = trie(false, &["a*"]);
        let a = t.nodes[ROOT].children[&Key::Char(b'a')];
        assert!(t.nodes[a].has_glob_child);
        let glob = t.nodes[a].children[&Key::Glob];
        assert!(t.nodes[glob].is_glob);
        assert!(t.nodes[glob].can_match);
    }

    #[test]
    fn test_len_counts_patterns() {
        let t = trie(true, &["a", "b", "a*"]);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_corrupted_arena_is_an_error() {
        let mut t = GlobTrie::new(false);
        t.add_path("ab").unwrap();
        let a = t.nodes[ROOT].children[&Key::Char(b'a')];
        t.nodes[a].children.insert(Key::Char(b'x'), 99);

        let err = t.add_path("axy").unwrap_err();
        assert!(matches!(err, Error::Trie(_)));
    }
}
