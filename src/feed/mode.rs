//! Feed modes and their wire framing.

use std::fmt;

use bytes::Bytes;
use serde_json::Value;

use crate::lifecycle::registry::PendingKind;

/// `feed=` parameter values, ordered from least to most streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FeedMode {
    #[default]
    Normal,
    LongPoll,
    Continuous,
    EventSource,
}

impl FeedMode {
    /// Parse `feed=`. Unknown values fall back to `Normal`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("longpoll") => FeedMode::LongPoll,
            Some("continuous") => FeedMode::Continuous,
            Some("eventsource") => FeedMode::EventSource,
            _ => FeedMode::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
            FeedMode::EventSource => "eventsource",
        }
    }

    /// One line per change instead of a single document.
    pub fn is_streaming(&self) -> bool {
        *self >= FeedMode::Continuous
    }

    /// Keep-alive bytes written on each heartbeat tick.
    pub fn heartbeat_token(&self) -> Bytes {
        match self {
            FeedMode::EventSource => Bytes::from_static(b"\n\n"),
            _ => Bytes::from_static(b"\r\n"),
        }
    }

    /// Frame one change row for the wire.
    pub fn frame(&self, row: &Value) -> Bytes {
        match self {
            FeedMode::EventSource => Bytes::from(format!("data: {}\n\n", row)),
            _ => Bytes::from(format!("{}\n", row)),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FeedMode::EventSource => "text/event-stream; charset=utf-8",
            _ => "application/json",
        }
    }

    /// Registry kind for a feed that stays open.
    pub fn pending_kind(&self) -> PendingKind {
        match self {
            FeedMode::EventSource => PendingKind::EventSource,
            FeedMode::Continuous => PendingKind::Continuous,
            _ => PendingKind::LongPoll,
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_falls_back_to_normal() {
        assert_eq!(FeedMode::parse(Some("continuous")), FeedMode::Continuous);
        assert_eq!(FeedMode::parse(Some("websocket")), FeedMode::Normal);
        assert_eq!(FeedMode::parse(None), FeedMode::Normal);
    }

    #[test]
    fn test_framing() {
        let row = json!({"seq": 1});
        assert_eq!(&FeedMode::Continuous.frame(&row)[..], b"{\"seq\":1}\n");
        assert_eq!(&FeedMode::EventSource.frame(&row)[..], b"data: {\"seq\":1}\n\n");
        assert_eq!(&FeedMode::Continuous.heartbeat_token()[..], b"\r\n");
        assert_eq!(&FeedMode::EventSource.heartbeat_token()[..], b"\n\n");
    }

    #[test]
    fn test_streaming_modes() {
        assert!(!FeedMode::Normal.is_streaming());
        assert!(!FeedMode::LongPoll.is_streaming());
        assert!(FeedMode::Continuous.is_streaming());
        assert!(FeedMode::EventSource.is_streaming());
    }
}
