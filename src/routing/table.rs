//! Route table: one trie per HTTP method.

use axum::http::Method;

use crate::routing::pattern::{parse_pattern, RouteError};
use crate::routing::trie::RouteNode;

/// A typed route definition consumed once at startup.
#[derive(Debug, Clone)]
pub struct RouteDef<T> {
    pub method: Method,
    pub pattern: &'static str,
    pub value: T,
}

impl<T> RouteDef<T> {
    pub fn new(method: Method, pattern: &'static str, value: T) -> Self {
        Self { method, pattern, value }
    }
}

/// Immutable per-method route tries.
#[derive(Debug)]
pub struct RouteTable<T> {
    get: RouteNode<T>,
    post: RouteNode<T>,
    put: RouteNode<T>,
    delete: RouteNode<T>,
}

impl<T> RouteTable<T> {
    /// Build the table, validating every pattern.
    pub fn build(defs: impl IntoIterator<Item = RouteDef<T>>) -> Result<Self, RouteError> {
        let mut table = Self {
            get: RouteNode::new(),
            post: RouteNode::new(),
            put: RouteNode::new(),
            delete: RouteNode::new(),
        };

        for def in defs {
            let segments = parse_pattern(def.pattern)?;
            let tree = match def.method {
                Method::GET => &mut table.get,
                Method::POST => &mut table.post,
                Method::PUT => &mut table.put,
                Method::DELETE => &mut table.delete,
                other => return Err(RouteError::UnsupportedMethod(other.to_string())),
            };
            if tree.insert(&segments, def.value).is_err() {
                return Err(RouteError::Duplicate {
                    method: def.method.to_string(),
                    pattern: def.pattern.to_string(),
                });
            }
        }

        Ok(table)
    }

    /// Tree for a request method. HEAD shares the GET tree.
    fn tree(&self, method: &Method) -> Option<&RouteNode<T>> {
        match *method {
            Method::GET | Method::HEAD => Some(&self.get),
            Method::POST => Some(&self.post),
            Method::PUT => Some(&self.put),
            Method::DELETE => Some(&self.delete),
            _ => None,
        }
    }

    /// Resolve a handler for `method` and the already-split path.
    pub fn resolve<S: AsRef<str>>(&self, method: &Method, path: &[S]) -> Option<&T> {
        self.tree(method).and_then(|tree| tree.find(path))
    }

    /// Lightweight existence check.
    pub fn has_route<S: AsRef<str>>(&self, method: &Method, path: &[S]) -> bool {
        self.resolve(method, path).is_some()
    }

    /// True when any method other than `method` (and its HEAD/GET alias) has a route.
    pub fn has_other_method<S: AsRef<str>>(&self, method: &Method, path: &[S]) -> bool {
        let own = self.tree(method);
        [&self.get, &self.post, &self.put, &self.delete]
            .into_iter()
            .filter(|tree| !own.is_some_and(|o| std::ptr::eq(o, *tree)))
            .any(|tree| tree.contains(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable<&'static str> {
        RouteTable::build(vec![
            RouteDef::new(Method::POST, "/widgets", "create"),
            RouteDef::new(Method::GET, "/gadgets", "list"),
        ])
        .unwrap()
    }

    #[test]
    fn test_head_uses_get_table() {
        let t = table();
        assert_eq!(t.resolve(&Method::HEAD, &["gadgets"]), Some(&"list"));
        assert!(t.resolve(&Method::HEAD, &["widgets"]).is_none());
    }

    #[test]
    fn test_other_method_probe() {
        let t = table();
        assert!(!t.has_route(&Method::GET, &["widgets"]));
        assert!(t.has_other_method(&Method::GET, &["widgets"]));
        assert!(!t.has_other_method(&Method::GET, &["nonexistent"]));
        assert!(!t.has_other_method(&Method::GET, &["gadgets"]));
        assert!(t.has_other_method(&Method::PATCH, &["gadgets"]));
    }

    #[test]
    fn test_build_rejects_duplicates_and_unknown_methods() {
        let dup = RouteTable::build(vec![
            RouteDef::new(Method::GET, "/a/*", 1),
            RouteDef::new(Method::GET, "/a/*", 2),
        ]);
        assert!(matches!(dup, Err(RouteError::Duplicate { .. })));

        let patch = RouteTable::build(vec![RouteDef::new(Method::PATCH, "/a", 1)]);
        assert!(matches!(patch, Err(RouteError::UnsupportedMethod(_))));
    }
}
