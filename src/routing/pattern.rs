//! Route pattern language.
//!
//! A pattern is a `/`-separated list of segments. Empty segments are ignored.
//!
//! | Segment   | Matches                                   |
//! |-----------|-------------------------------------------|
//! | `name`    | exactly `name`                            |
//! | `{re}`    | one segment matching `^(?:re)$`           |
//! | `*`       | exactly one segment                       |
//! | `**`      | one or more remaining segments (last only)|
//!
//! Patterns are parsed and validated once, when the route table is built.

use regex::Regex;
use thiserror::Error;

/// Errors raised while building a route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid regex segment `{segment}` in `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        segment: String,
        #[source]
        source: regex::Error,
    },

    #[error("`**` must be the last segment in `{0}`")]
    GreedyNotLast(String),

    #[error("empty regex segment in `{0}`")]
    EmptyRegex(String),

    #[error("duplicate handler for {method} `{pattern}`")]
    Duplicate { method: String, pattern: String },

    #[error("unsupported method {0} in route list")]
    UnsupportedMethod(String),
}

/// One parsed pattern segment.
#[derive(Debug, Clone)]
pub enum Segment {
    Literal(String),
    Pattern(Regex),
    Wildcard,
    Greedy,
}

impl Segment {
    /// Source text for regex segments, used to merge identical patterns.
    pub fn regex_source(&self) -> Option<&str> {
        match self {
            Segment::Pattern(re) => Some(re.as_str()),
            _ => None,
        }
    }
}

/// Parse and validate a route pattern.
pub fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());

    for (i, part) in raw.iter().enumerate() {
        let segment = match *part {
            "**" => {
                if i + 1 != raw.len() {
                    return Err(RouteError::GreedyNotLast(pattern.to_string()));
                }
                Segment::Greedy
            }
            "*" => Segment::Wildcard,
            s if s.starts_with('{') && s.ends_with('}') && s.len() >= 2 => {
                let body = &s[1..s.len() - 1];
                if body.is_empty() {
                    return Err(RouteError::EmptyRegex(pattern.to_string()));
                }
                let re = Regex::new(&format!("^(?:{})$", body)).map_err(|source| {
                    RouteError::InvalidRegex {
                        pattern: pattern.to_string(),
                        segment: s.to_string(),
                        source,
                    }
                })?;
                Segment::Pattern(re)
            }
            s => Segment::Literal(s.to_string()),
        };
        segments.push(segment);
    }

    Ok(segments)
}

/// Split a concrete request path into segments, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
