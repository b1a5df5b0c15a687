//! Route node trie.
//!
//! # Design Decisions
//! - Precedence at each level: literal > regex (first registered) > wildcard > greedy
//! - Lookup backtracks: if a more specific branch dead-ends deeper down,
//!   the next candidate at that level is tried
//! - A greedy child consumes every remaining segment and always matches

use std::collections::HashMap;

use regex::Regex;

use crate::routing::pattern::Segment;

/// One path-segment level of a route trie.
#[derive(Debug)]
pub struct RouteNode<T> {
    literals: HashMap<String, RouteNode<T>>,
    patterns: Vec<(Regex, RouteNode<T>)>,
    wildcard: Option<Box<RouteNode<T>>>,
    greedy: Option<Box<RouteNode<T>>>,
    value: Option<T>,
}

impl<T> Default for RouteNode<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            patterns: Vec::new(),
            wildcard: None,
            greedy: None,
            value: None,
        }
    }
}

impl<T> RouteNode<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk or create the nodes for `segments` and attach `value` to the last.
    ///
    /// Returns the value back if that node already carries a handler.
    pub fn insert(&mut self, segments: &[Segment], value: T) -> Result<(), T> {
        let node = self.node_for(segments);
        if node.value.is_some() {
            return Err(value);
        }
        node.value = Some(value);
        Ok(())
    }

    fn node_for(&mut self, segments: &[Segment]) -> &mut RouteNode<T> {
        let Some((head, rest)) = segments.split_first() else {
            return self;
        };

        let child = match head {
            Segment::Literal(name) => self.literals.entry(name.clone()).or_default(),
            Segment::Pattern(re) => {
                let pos = self
                    .patterns
                    .iter()
                    .position(|(existing, _)| existing.as_str() == re.as_str());
                let idx = match pos {
                    Some(idx) => idx,
                    None => {
                        self.patterns.push((re.clone(), RouteNode::new()));
                        self.patterns.len() - 1
                    }
                };
                &mut self.patterns[idx].1
            }
            Segment::Wildcard => &mut **self.wildcard.get_or_insert_with(Default::default),
            Segment::Greedy => &mut **self.greedy.get_or_insert_with(Default::default),
        };
        child.node_for(rest)
    }

    /// Find the value attached to the best match for `path`.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&T> {
        let Some((head, rest)) = path.split_first() else {
            return self.value.as_ref();
        };
        let head = head.as_ref();

        if let Some(found) = self.literals.get(head).and_then(|c| c.find(rest)) {
            return Some(found);
        }

        for (re, child) in &self.patterns {
            if re.is_match(head) {
                if let Some(found) = child.find(rest) {
                    return Some(found);
                }
            }
        }

        if let Some(found) = self.wildcard.as_ref().and_then(|c| c.find(rest)) {
            return Some(found);
        }

        self.greedy.as_ref().and_then(|g| g.value.as_ref())
    }

    /// True when `path` resolves to a value.
    pub fn contains<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.find(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::pattern::parse_pattern;

    fn build(routes: &[(&str, &'static str)]) -> RouteNode<&'static str> {
        let mut root = RouteNode::new();
        for (pattern, name) in routes {
            root.insert(&parse_pattern(pattern).unwrap(), *name).unwrap();
        }
        root
    }

    #[test]
    fn test_precedence() {
        let root = build(&[
            ("/a", "a"),
            ("/a/*", "wildcard"),
            ("/a/**", "greedy"),
            ("/a/{^x.*$}", "regex"),
            ("/a/lit", "literal"),
        ]);

        assert_eq!(root.find(&["a"]), Some(&"a"));
        assert_eq!(root.find(&["a", "lit"]), Some(&"literal"));
        assert_eq!(root.find(&["a", "xylophone"]), Some(&"regex"));
        assert_eq!(root.find(&["a", "b"]), Some(&"wildcard"));
        assert_eq!(root.find(&["a", "b", "c"]), Some(&"greedy"));
        assert_eq!(root.find(&["a", "b", "c", "d"]), Some(&"greedy"));
        assert_eq!(root.find(&["z"]), None);
    }

    #[test]
    fn test_empty_trie() {
        let root: RouteNode<&str> = RouteNode::new();
        assert!(root.find(&["anything"]).is_none());
        assert!(root.find::<&str>(&[]).is_none());
    }

    #[test]
    fn test_first_registered_regex_wins() {
        let root = build(&[("/{a.*}", "first"), ("/{ab.*}", "second")]);
        assert_eq!(root.find(&["abc"]), Some(&"first"));
    }

    #[test]
    fn test_backtracks_from_dead_end() {
        let root = build(&[("/{[^_].*}/_changes", "changes"), ("/*/doc", "doc")]);
        assert_eq!(root.find(&["db", "doc"]), Some(&"doc"));
        assert_eq!(root.find(&["db", "_changes"]), Some(&"changes"));
    }

    #[test]
    fn test_intermediate_node_without_handler() {
        let root = build(&[("/a/b/c", "deep")]);
        assert!(root.find(&["a", "b"]).is_none());
        assert!(root.contains(&["a", "b", "c"]));
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let mut root = RouteNode::new();
        root.insert(&parse_pattern("/x/*").unwrap(), 1).unwrap();
        assert_eq!(root.insert(&parse_pattern("/x/*").unwrap(), 2), Err(2));
    }

    #[test]
    fn test_identical_regex_segments_share_node() {
        let root = build(&[("/{[^_].*}", "db"), ("/{[^_].*}/_all_docs", "all_docs")]);
        assert_eq!(root.find(&["mydb"]), Some(&"db"));
        assert_eq!(root.find(&["mydb", "_all_docs"]), Some(&"all_docs"));
        assert!(root.find(&["_mydb"]).is_none());
    }
}
