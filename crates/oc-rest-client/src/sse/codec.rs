//! Server-sent events frame decoder
//!
//! Implements the `text/event-stream` line format as a `tokio_util` codec so
//! it can be driven by `FramedRead` over any byte source. Lines end in `\n`,
//! `\r\n` or `\r`; a blank line dispatches the buffered event. Comments and
//! unknown fields are skipped. An event still being buffered when the input
//! ends is discarded.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::Decoder;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One decoded frame of the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event type, `"message"` when the frame did not name one
    pub event: String,
    /// Payload; multiple `data:` lines are joined with `\n`
    pub data: String,
    /// Last event id seen on this connection
    pub id: Option<String>,
    /// Reconnection time requested by the server
    pub retry: Option<Duration>,
}

impl Event {
    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[derive(Debug, Error)]
pub enum SseDecodeError {
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("event stream line is not valid UTF-8")]
    InvalidUtf8,

    #[error("event stream line exceeds {0} bytes")]
    LineTooLong(usize),
}

#[derive(Debug)]
pub struct SseCodec {
    started: bool,
    event_type: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    max_line_length: usize,
    /// Bytes of the buffered partial line already searched for a terminator
    next_index: usize,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseCodec {
    /// Lines longer than this are treated as a broken stream
    pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            started: false,
            event_type: None,
            data: String::new(),
            has_data: false,
            last_event_id: None,
            retry: None,
            max_line_length: Self::DEFAULT_MAX_LINE_LENGTH,
            next_index: 0,
        }
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Split the next complete line off `src`, without its terminator.
    fn next_line(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<BytesMut>, SseDecodeError> {
        let start = self.next_index.min(src.len());
        let Some(offset) = src[start..].iter().position(|b| *b == b'\n' || *b == b'\r') else {
            if src.len() > self.max_line_length {
                return Err(SseDecodeError::LineTooLong(self.max_line_length));
            }
            self.next_index = src.len();
            return Ok(None);
        };
        let pos = start + offset;

        // A trailing '\r' may be the first half of "\r\n".
        if src[pos] == b'\r' && pos + 1 == src.len() && !eof {
            self.next_index = pos;
            return Ok(None);
        }

        self.next_index = 0;
        let line = src.split_to(pos);
        let terminator = if src.starts_with(b"\r\n") { 2 } else { 1 };
        src.advance(terminator);
        Ok(Some(line))
    }

    fn process_line(&mut self, line: &str) -> Option<Event> {
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
            "event" => self.event_type = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        let event_type = self.event_type.take();
        let retry = self.retry.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;

        Some(Event {
            event: event_type.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
            retry,
        })
    }

    fn decode_lines(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<Event>, SseDecodeError> {
        if !self.started {
            if src.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&src[..]) && !eof {
                return Ok(None);
            }
            if src.starts_with(UTF8_BOM) {
                src.advance(UTF8_BOM.len());
            }
            self.started = true;
        }

        while let Some(line) = self.next_line(src, eof)? {
            let line = std::str::from_utf8(&line).map_err(|_| SseDecodeError::InvalidUtf8)?;
            if let Some(event) = self.process_line(line) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

impl Decoder for SseCodec {
    type Item = Event;
    type Error = SseDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, SseDecodeError> {
        self.decode_lines(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Event>, SseDecodeError> {
        if let Some(event) = self.decode_lines(src, true)? {
            return Ok(Some(event));
        }
        // Unterminated trailing line and half-built event are dropped.
        src.clear();
        self.next_index = 0;
        self.event_type = None;
        self.data.clear();
        self.has_data = false;
        self.retry = None;
        Ok(None)
    }
}
