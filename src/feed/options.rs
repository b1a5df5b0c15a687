//! `_changes` parameter parsing.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ListenerError, ListenerResult};
use crate::feed::mode::FeedMode;
use crate::store::{FilterParams, Sequence};

/// Smallest heartbeat interval a client can request.
pub const MIN_HEARTBEAT: Duration = Duration::from_millis(5000);

/// Parsed `_changes` request.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub mode: FeedMode,
    pub since: Sequence,
    pub limit: Option<usize>,
    pub include_docs: bool,
    /// `style=all_docs`: report every leaf revision.
    pub include_conflicts: bool,
    pub heartbeat: Option<Duration>,
    pub filter: Option<String>,
    /// Handed to the filter. Every request parameter.
    pub filter_params: FilterParams,
}

impl ChangesOptions {
    /// Parse from request parameters.
    ///
    /// Unknown `feed` values and unparsable `since`/`limit` fall back to
    /// defaults. For feeds that stay open, a `heartbeat` that is not a
    /// positive integer is an error; `normal` feeds ignore it.
    pub fn from_params(params: &HashMap<String, String>) -> ListenerResult<Self> {
        let get = |name: &str| params.get(name).map(String::as_str);
        let mode = FeedMode::parse(get("feed"));

        // Only feeds that stay open send heartbeats.
        let heartbeat = match get("heartbeat").filter(|_| mode != FeedMode::Normal) {
            None => None,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(ms) if ms > 0 => Some(clamp_heartbeat(ms as u64)),
                _ => {
                    return Err(ListenerError::BadParam(format!(
                        "invalid heartbeat `{}`",
                        raw
                    )))
                }
            },
        };

        Ok(Self {
            mode,
            since: get("since").and_then(|s| s.trim().parse().ok()).unwrap_or(0),
            limit: get("limit").and_then(|s| s.trim().parse().ok()),
            include_docs: parse_bool(get("include_docs")),
            include_conflicts: get("style") == Some("all_docs"),
            heartbeat,
            filter: get("filter").filter(|f| !f.is_empty()).map(str::to_string),
            filter_params: params.clone(),
        })
    }
}

/// Apply the heartbeat floor.
pub fn clamp_heartbeat(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_HEARTBEAT)
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}
