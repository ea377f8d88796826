//! Incremental `text/event-stream` decoder.

use std::fmt;

const MAX_LINE_SIZE: usize = 64 * 1024;
const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseError {
    LineTooLong(usize),
}

impl fmt::Display for SseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LineTooLong(len) => {
                write!(f, "event-stream line too long ({len} bytes, max {MAX_LINE_SIZE})")
            }
        }
    }
}

impl std::error::Error for SseError {}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    started: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    retry_ms: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-suggested reconnection time, if one was announced.
    pub fn retry_hint_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        self.buf.extend_from_slice(chunk);
        if !self.started {
            if self.buf.len() < 3 && b"\xEF\xBB\xBF".starts_with(&self.buf) {
                return Ok(Vec::new());
            }
            if self.buf.starts_with(b"\xEF\xBB\xBF") {
                self.buf.drain(..3);
            }
            self.started = true;
        }

        let mut events = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.buf[consumed..];
            let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };
            let line_end = consumed + pos;
            let next = if self.buf[line_end] == b'\r' {
                match self.buf.get(line_end + 1) {
                    Some(b'\n') => line_end + 2,
                    Some(_) => line_end + 1,
                    // A lone CR at the end might be the first half of CRLF.
                    None => break,
                }
            } else {
                line_end + 1
            };
            let line = String::from_utf8_lossy(&self.buf[consumed..line_end]).into_owned();
            consumed = next;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buf.drain(..consumed);

        if self.buf.len() > MAX_LINE_SIZE {
            let len = self.buf.len();
            self.buf.clear();
            return Err(SseError::LineTooLong(len));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let has_data = std::mem::take(&mut self.has_data);
        let data = std::mem::take(&mut self.data);
        // Blocks whose data is absent or empty carry nothing to deliver.
        if !has_data || data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}
