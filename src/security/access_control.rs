//! Access control predicate.
//! Runs before every handler; a rejection short-circuits dispatch.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::Method;

use crate::config::ServerConfig;
use crate::error::{ListenerError, ListenerResult};

/// Decides whether a request may reach its handler.
pub trait AccessCheck: Send + Sync {
    fn check(&self, method: &Method, segments: &[String]) -> ListenerResult<()>;
}

/// Read-only mode: reads, plus the POSTs replicators use to read.
pub struct ReadOnlyAccess {
    config: Arc<ArcSwap<ServerConfig>>,
}

impl ReadOnlyAccess {
    pub fn new(config: Arc<ArcSwap<ServerConfig>>) -> Self {
        Self { config }
    }
}

/// POST endpoints that do not modify anything.
const READ_POSTS: &[&str] = &["_revs_diff", "_all_docs", "_changes"];

impl AccessCheck for ReadOnlyAccess {
    fn check(&self, method: &Method, segments: &[String]) -> ListenerResult<()> {
        if !self.config.load().access.read_only {
            return Ok(());
        }
        let allowed = match *method {
            Method::GET | Method::HEAD => true,
            Method::POST => segments
                .last()
                .is_some_and(|s| segments.len() == 2 && READ_POSTS.contains(&s.as_str())),
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            tracing::debug!(method = %method, "Write refused in read-only mode");
            Err(ListenerError::Forbidden(
                "this listener is read-only".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_read_only_mode() {
        let mut config = ServerConfig::default();
        config.access.read_only = true;
        let live = Arc::new(ArcSwap::from_pointee(config));
        let check = ReadOnlyAccess::new(live.clone());

        assert!(check.check(&Method::GET, &segs(&["db", "doc"])).is_ok());
        assert!(check.check(&Method::POST, &segs(&["db", "_revs_diff"])).is_ok());
        assert!(check.check(&Method::PUT, &segs(&["db", "doc"])).is_err());
        assert!(check.check(&Method::POST, &segs(&["db", "_bulk_docs"])).is_err());

        live.store(Arc::new(ServerConfig::default()));
        assert!(check.check(&Method::PUT, &segs(&["db", "doc"])).is_ok());
    }
}
