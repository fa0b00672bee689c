//! Server-Sent Events line parser.
//!
//! Lines are read with a bounded [`LinesCodec`] so a single oversized line cannot
//! grow the buffer without limit. Lines are grouped into [`SseEvent`]s on blank-line
//! terminators; `data:` lines are joined with `\n`.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::ZaiError;

/// Maximum accepted length of a single line, in bytes
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Data payload marking the natural end of a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// A single dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (from `event:`)
    pub event: String,
    /// Data payload (from `data:` lines, joined with `\n`)
    pub data: String,
    /// Event id (from `id:`)
    pub id: String,
    /// Reconnection hint in milliseconds (from `retry:`)
    pub retry: Option<u64>,
    /// The raw lines that made up the event
    pub raw: String,
}

impl SseEvent {
    /// True if no textual field was set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_empty() && self.data.is_empty() && self.id.is_empty()
    }

    /// True if the trimmed data is the `[DONE]` sentinel
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Result of reading up to the next event boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A regular event
    Event(SseEvent),
    /// The `[DONE]` sentinel; the stream has ended
    Done(SseEvent),
    /// The reader reached EOF with nothing pending
    Eof,
}

/// One classified line of an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// Blank line, terminates an event
    Empty,
    /// `:`-prefixed comment
    Comment(&'a str),
    /// `name: value`, with at most one leading space removed from the value
    Field {
        /// Field name
        name: &'a str,
        /// Field value
        value: &'a str,
    },
}

/// Classifies a single line (without its terminator)
#[must_use]
pub fn parse_line(line: &str) -> Line<'_> {
    if line.is_empty() {
        return Line::Empty;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return Line::Comment(comment);
    }
    match line.split_once(':') {
        Some((name, value)) => Line::Field {
            name,
            value: value.strip_prefix(' ').unwrap_or(value),
        },
        None => Line::Field {
            name: line,
            value: "",
        },
    }
}

/// Incremental event parser over an async byte source
pub struct SseParser<R> {
    lines: FramedRead<R, LinesCodec>,
    pending: SseEvent,
    has_data: bool,
}

impl<R> std::fmt::Debug for SseParser<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseParser")
            .field("pending", &self.pending)
            .field("has_data", &self.has_data)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> SseParser<R> {
    /// Creates a parser accepting lines up to [`MAX_LINE_BYTES`]
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, MAX_LINE_BYTES)
    }

    /// Creates a parser with a custom line-length bound
    pub fn with_max_line_length(reader: R, max: usize) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max)),
            pending: SseEvent::default(),
            has_data: false,
        }
    }

    /// Reads lines until an event is complete or the reader ends.
    ///
    /// An event still pending at EOF (no trailing blank line) is emitted rather than
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ZaiError::Sse`] if a line exceeds the length bound, is not UTF-8, or
    /// the underlying reader fails.
    pub async fn next_event(&mut self) -> Result<Parsed, ZaiError> {
        loop {
            match self.lines.next().await {
                Some(Ok(line)) => {
                    if let Some(event) = self.feed(&line) {
                        return Ok(classify(event));
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(ZaiError::Sse("line exceeds maximum length".into()));
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(ZaiError::Sse(format!("read failed: {e}")));
                }
                None => {
                    return Ok(self.take_pending().map_or(Parsed::Eof, classify));
                }
            }
        }
    }

    fn feed(&mut self, line: &str) -> Option<SseEvent> {
        tracing::trace!(line, "sse line");
        match parse_line(line) {
            Line::Empty => self.take_pending(),
            Line::Comment(_) => None,
            Line::Field { name, value } => {
                if !self.pending.raw.is_empty() {
                    self.pending.raw.push('\n');
                }
                self.pending.raw.push_str(line);

                match name {
                    "data" => {
                        if self.has_data {
                            self.pending.data.push('\n');
                        }
                        self.pending.data.push_str(value);
                        self.has_data = true;
                    }
                    "event" => value.clone_into(&mut self.pending.event),
                    "id" if !value.contains('\0') => value.clone_into(&mut self.pending.id),
                    "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                        self.pending.retry = value.parse().ok();
                    }
                    _ => {}
                }
                None
            }
        }
    }

    fn take_pending(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.pending);
        std::mem::take(&mut self.has_data).then_some(event)
    }
}

fn classify(event: SseEvent) -> Parsed {
    if event.is_done() {
        Parsed::Done(event)
    } else {
        Parsed::Event(event)
    }
}
