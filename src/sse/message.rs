//! Parsed Server-Sent Events messages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub(crate) const DEFAULT_EVENT_TYPE: &str = "message";

/// A single dispatched SSE event
///
/// Messages are only built from complete event blocks, so every field is final
/// by the time a caller sees one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: Option<String>,
    #[serde(rename = "type")]
    event: String,
    data: String,
    retry: Option<Duration>,
}

impl Message {
    /// Create a `message`-typed event carrying `data`
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
            retry: None,
        }
    }

    /// Set the event id; an empty id means no id, as on the wire
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into()).filter(|id: &String| !id.is_empty());
        self
    }

    /// Set the event type; an empty type falls back to `message`
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        let event = event.into();
        self.event = if event.is_empty() {
            DEFAULT_EVENT_TYPE.to_string()
        } else {
            event
        };
        self
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The event id, absent when the block had no (or an empty) `id` field
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The event type, `"message"` unless the block set `event`
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Reconnection delay requested by the server
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Build a message from one event block (lines without the closing blank line)
    ///
    /// Returns `None` when the block holds only comments or unknown fields.
    pub fn parse_block(block: &str) -> Option<Self> {
        let mut seen = false;
        let mut id = None;
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        let mut retry = None;

        for line in block
            .split(|c| c == '\r' || c == '\n')
            .filter(|line| !line.is_empty())
        {
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.find(':') {
                Some(pos) => (&line[..pos], &line[pos + 1..]),
                None => (line, ""),
            };
            let value = value.strip_prefix(' ').unwrap_or(value);

            match field {
                "id" => {
                    seen = true;
                    // ids carrying NUL are ignored outright
                    if !value.contains('\0') {
                        id = Some(value);
                    }
                }
                "event" => {
                    seen = true;
                    event = Some(value);
                }
                "data" => {
                    seen = true;
                    data.push(value);
                }
                "retry" => {
                    seen = true;
                    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(millis) = value.parse::<u64>() {
                            retry = Some(Duration::from_millis(millis));
                        }
                    }
                }
                _ => {}
            }
        }

        if !seen {
            return None;
        }

        Some(Self {
            id: id.filter(|id| !id.is_empty()).map(str::to_string),
            event: event
                .filter(|event| !event.is_empty())
                .unwrap_or(DEFAULT_EVENT_TYPE)
                .to_string(),
            data: data.join("\n"),
            retry,
        })
    }

    /// Encode the message as an event stream block, closing blank line included
    ///
    /// Only `data` may span lines. An id or event type containing `\r`, `\n`
    /// (or an id containing NUL) cannot be represented and will not parse back
    /// to the same message.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(id) = &self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if self.event != DEFAULT_EVENT_TYPE {
            out.push_str(&format!("event: {}\n", self.event));
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {}\n", retry.as_millis()));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        out.push('\n');

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "[{}#{}] {}", self.event, id, self.data),
            None => write!(f, "[{}] {}", self.event, self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block() {
        let message = Message::parse_block("data: test\ndata:test\nid: 12\nevent: testEvent\n").unwrap();
        assert_eq!(message, Message::new("test\ntest").with_id("12").with_event("testEvent"));
    }

    #[test]
    fn test_field_without_colon() {
        let message = Message::parse_block("event: testEvent\ndata\n").unwrap();
        assert_eq!(message, Message::new("").with_event("testEvent"));
    }

    #[test]
    fn test_retry_only_block() {
        let message = Message::parse_block("retry: 12").unwrap();
        assert_eq!(message.retry(), Some(Duration::from_millis(12)));
        assert_eq!(message.data(), "");
        assert_eq!(message.event(), "message");
    }

    #[test]
    fn test_malformed_retry_ignored() {
        assert_eq!(Message::parse_block("retry: 12x").unwrap().retry(), None);
        assert_eq!(Message::parse_block("retry: -12").unwrap().retry(), None);
        assert_eq!(Message::parse_block("retry:").unwrap().retry(), None);
    }

    #[test]
    fn test_embedded_blank_data_lines() {
        let message =
            Message::parse_block("\n\ndata: <tag>\ndata\ndata:   <foo />\ndata\ndata: </tag>")
                .unwrap();
        assert_eq!(message.data(), "<tag>\n\n  <foo />\n\n</tag>");
    }

    #[test]
    fn test_comment_only_block() {
        assert!(Message::parse_block(":ok").is_none());
        assert!(Message::parse_block(":ok\n: still a comment").is_none());
        assert!(Message::parse_block("unknown: field").is_none());
    }

    #[test]
    fn test_empty_id_is_absent() {
        let message = Message::parse_block("id: 5\nid:\ndata: x").unwrap();
        assert_eq!(message.id(), None);
    }

    #[test]
    fn test_wire_round_trip() {
        let original = Message::new("first line\n  second line\n")
            .with_id("42")
            .with_event("update")
            .with_retry(Duration::from_millis(1500));

        let wire = original.to_wire();
        let block = wire.trim_end_matches('\n');
        assert_eq!(Message::parse_block(block), Some(original));
    }

    #[test]
    fn test_empty_id_and_event_match_the_wire() {
        let message = Message::new("x").with_id("").with_event("");
        assert_eq!(message.id(), None);
        assert_eq!(message.event(), "message");
        assert_eq!(message.to_wire(), "data: x\n\n");
        assert_eq!(Message::parse_block("data: x"), Some(message));
    }
}
