//! Minimal line-oriented SSE scanner. Callers push bytes as they arrive and
//! drain complete events; a trailing partial event is flushed via `finish`.
//!
//! Line-size safety per spec §4.C4: the buffer starts at 64 KiB and grows
//! only up to a configurable `max_line_size`; a line (including any
//! already-buffered partial line) that would exceed it raises
//! `SseError::ResponseTooLarge` exactly once, after which the parser is
//! poisoned and returns the same error on every further push.

use bytes::Bytes;

/// Matches `GatewayConfig::max_line_size`'s default.
const DEFAULT_MAX_LINE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SseError {
    #[error("response_too_large")]
    ResponseTooLarge,
}

#[derive(Debug)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
    max_line_size: usize,
    poisoned: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::with_max_line_size(DEFAULT_MAX_LINE_SIZE)
    }

    pub fn with_max_line_size(max_line_size: usize) -> Self {
        Self {
            buffer: String::with_capacity(DEFAULT_MAX_LINE_SIZE.min(max_line_size)),
            event: None,
            data_lines: Vec::new(),
            max_line_size,
            poisoned: false,
        }
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Result<Vec<SseEvent>, SseError> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Result<Vec<SseEvent>, SseError> {
        if self.poisoned {
            return Err(SseError::ResponseTooLarge);
        }
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some(pos) = self.buffer.find('\n') else {
                if self.buffer.len() > self.max_line_size {
                    self.poisoned = true;
                    return Err(SseError::ResponseTooLarge);
                }
                break;
            };
            if pos > self.max_line_size {
                self.poisoned = true;
                return Err(SseError::ResponseTooLarge);
            }

            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }
            if line == "event" {
                self.event = None;
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
                continue;
            }
        }

        Ok(events)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiline_data_fields() {
        let mut parser = SseParser::new();
        let events = parser
            .push_str("event: content_block_delta\ndata: {\"a\":1}\ndata: {\"b\":2}\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"a\":1}\n{\"b\":2}");
    }

    #[test]
    fn handles_partial_chunks_across_calls() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: hel").unwrap().is_empty());
        let events = parser.push_str("lo\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn finish_flushes_trailing_event_without_blank_line() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").unwrap().is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keep-alive\ndata: x\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn line_exactly_at_max_size_succeeds() {
        let mut parser = SseParser::with_max_line_size(16);
        let line = format!("data:{}\n\n", "x".repeat(11));
        assert_eq!(line.len() - 2, 16);
        let events = parser.push_str(&line).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn line_one_byte_over_max_size_emits_response_too_large_once() {
        let mut parser = SseParser::with_max_line_size(16);
        let line = format!("data:{}\n\n", "x".repeat(12));
        assert_eq!(line.len() - 2, 17);
        assert_eq!(parser.push_str(&line), Err(SseError::ResponseTooLarge));
        assert_eq!(parser.push_str("data: more\n\n"), Err(SseError::ResponseTooLarge));
    }

    #[test]
    fn oversized_line_split_across_pushes_is_still_caught() {
        let mut parser = SseParser::with_max_line_size(16);
        assert!(parser.push_str("data:").unwrap().is_empty());
        assert_eq!(
            parser.push_str(&"x".repeat(20)),
            Err(SseError::ResponseTooLarge)
        );
    }
}
