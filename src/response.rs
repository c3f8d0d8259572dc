//! Streaming HTTP/1.x response parser.
//!
//! The parser is driven one byte at a time and keeps its whole position in a
//! `ParseState` value, so a response may arrive in any number of segments
//! (down to a single byte each) without ever being buffered. Header names
//! are recognised with the matchers in `crate::matcher`; the only value that
//! is accumulated is `Content-Length`, and that is done arithmetically.
//!
//! After the header, body bytes are scanned only for an HTML `<title` tag.
//! The body is length-capped: when the response declares a content length,
//! `parse` never consumes bytes past the end of the body. Whatever it does
//! not consume belongs to a response the connection never asked for.

use crate::matcher::{Field, FieldScan, TagScan};

use std::fmt;

const VERSION_LITERAL: &[u8] = b"HTTP/";
const TITLE_CAPACITY: usize = 64;

/// Coarse position in the response grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Number of bytes of `HTTP/` matched.
    Version(u8),
    Major,
    Minor,
    StatusStart,
    Status,
    StatusEnd,
    FieldStart,
    FieldName,
    FieldColon,
    FieldValueStart,
    FieldValue,
    FieldValueEnd,
    Content,
    ContentTag,
    ContentField,
    Done,
}

impl Phase {
    fn in_header(self) -> bool {
        !self.in_body() && self != Phase::Done
    }

    fn in_body(self) -> bool {
        matches!(self, Phase::Content | Phase::ContentTag | Phase::ContentField)
    }
}

/// Everything needed to resume parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseState {
    pub phase: Phase,
    pub field_scan: FieldScan,
    pub tag_scan: TagScan,
    /// Header field whose value is being read.
    pub field: Field,
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState {
            phase: Phase::Version(0),
            field_scan: FieldScan::default(),
            tag_scan: TagScan::default(),
            field: Field::Unknown,
        }
    }
}

/// Result of one `parse` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Bytes of the input that belong to this response.
    pub consumed: usize,
    /// Set on exactly one call per response.
    pub complete: bool,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    state: ParseState,
    major: u16,
    minor: u16,
    status: u16,
    content_length: u64,
    content_seen: u64,
    content_length_seen: bool,
    is_error: bool,
    title: [u8; TITLE_CAPACITY],
    title_len: usize,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            state: ParseState::default(),
            major: 0,
            minor: 0,
            status: 0,
            content_length: 0,
            content_seen: 0,
            content_length_seen: false,
            is_error: false,
            title: [0; TITLE_CAPACITY],
            title_len: 0,
        }
    }
}

fn is_space(byte: u8) -> bool {
    byte.is_ascii_whitespace()
}

fn push_digit16(value: u16, byte: u8) -> u16 {
    value.saturating_mul(10).saturating_add(u16::from(byte - b'0'))
}

fn push_digit64(value: u64, byte: u8) -> u64 {
    value.saturating_mul(10).saturating_add(u64::from(byte - b'0'))
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse::default()
    }

    /// Prepares for the next response on the same connection.
    pub fn reset(&mut self) {
        *self = HttpResponse::default();
    }

    #[cfg(test)]
    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn version(&self) -> (u16, u16) {
        (self.major, self.minor)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_length(&self) -> Option<u64> {
        if self.content_length_seen {
            Some(self.content_length)
        } else {
            None
        }
    }

    pub fn content_seen(&self) -> u64 {
        self.content_seen
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is_done(&self) -> bool {
        self.state.phase == Phase::Done
    }

    /// Title text, capped at 64 bytes.
    pub fn title(&self) -> &[u8] {
        &self.title[..self.title_len]
    }

    /// Feeds the next chunk of the response stream.
    ///
    /// A malformed status line ends the response with `is_error` set; all
    /// offered bytes are then swallowed. Once a response is complete further
    /// calls consume nothing until `reset`.
    pub fn parse(&mut self, input: &[u8]) -> Progress {
        if self.is_done() {
            return Progress {
                consumed: 0,
                complete: false,
            };
        }

        let mut offset = 0;
        while offset < input.len() && self.state.phase.in_header() {
            self.state = self.transition(self.state, input[offset]);
            offset += 1;
        }

        if self.is_done() {
            return Progress {
                consumed: input.len(),
                complete: true,
            };
        }
        if !self.state.phase.in_body() {
            return Progress {
                consumed: offset,
                complete: false,
            };
        }

        let mut end = input.len();
        if self.content_length_seen {
            let remaining = self.content_length - self.content_seen;
            if remaining < (end - offset) as u64 {
                end = offset + remaining as usize;
            }
        }
        for &byte in &input[offset..end] {
            self.body_step(byte);
        }
        self.content_seen += (end - offset) as u64;

        let complete = self.content_length_seen && self.content_seen == self.content_length;
        if complete {
            self.state.phase = Phase::Done;
        }
        Progress {
            consumed: end,
            complete,
        }
    }

    /// Tells the parser the peer has stopped sending. A body without a
    /// `Content-Length` only completes this way. Returns true if that
    /// completed the response.
    pub fn finish(&mut self) -> bool {
        if self.state.phase.in_body() && !self.content_length_seen {
            self.state.phase = Phase::Done;
            true
        } else {
            false
        }
    }

    fn fail(&mut self, mut state: ParseState) -> ParseState {
        self.is_error = true;
        state.phase = Phase::Done;
        state
    }

    /// One header byte: status line and header fields.
    fn transition(&mut self, mut state: ParseState, byte: u8) -> ParseState {
        match state.phase {
            Phase::Version(matched) => {
                let matched = matched as usize;
                if byte.to_ascii_uppercase() != VERSION_LITERAL[matched] {
                    return self.fail(state);
                }
                state.phase = if matched + 1 == VERSION_LITERAL.len() {
                    Phase::Major
                } else {
                    Phase::Version(matched as u8 + 1)
                };
            }
            Phase::Major => match byte {
                b'.' => state.phase = Phase::Minor,
                b'0'..=b'9' => self.major = push_digit16(self.major, byte),
                _ => return self.fail(state),
            },
            Phase::Minor => match byte {
                b'0'..=b'9' => self.minor = push_digit16(self.minor, byte),
                _ if is_space(byte) => state.phase = Phase::StatusStart,
                _ => return self.fail(state),
            },
            Phase::StatusStart => match byte {
                b'\n' => {
                    self.status = 0;
                    state.phase = Phase::FieldStart;
                }
                b'0'..=b'9' => {
                    self.status = u16::from(byte - b'0');
                    state.phase = Phase::Status;
                }
                _ if is_space(byte) => {}
                _ => {
                    self.status = 0;
                    state.phase = Phase::StatusEnd;
                }
            },
            Phase::Status => match byte {
                b'0'..=b'9' => self.status = push_digit16(self.status, byte),
                b'\n' => state.phase = Phase::FieldStart,
                _ => state.phase = Phase::StatusEnd,
            },
            Phase::StatusEnd => {
                if byte == b'\n' {
                    state.phase = Phase::FieldStart;
                }
            }
            Phase::FieldStart => match byte {
                b'\r' => {}
                b'\n' => {
                    self.content_seen = 0;
                    state.tag_scan = TagScan::default();
                    state.phase = Phase::Content;
                }
                _ => {
                    state.field_scan = FieldScan::default();
                    return self.field_name(state, byte);
                }
            },
            Phase::FieldName => return self.field_name(state, byte),
            Phase::FieldColon => match byte {
                b'\n' => state.phase = Phase::FieldStart,
                _ if is_space(byte) => {}
                _ => return self.field_value_start(state, byte),
            },
            Phase::FieldValueStart => return self.field_value_start(state, byte),
            Phase::FieldValue => {
                if byte == b'\n' {
                    state.phase = Phase::FieldStart;
                } else if state.field == Field::ContentLength {
                    if byte.is_ascii_digit() {
                        self.content_length = push_digit64(self.content_length, byte);
                    } else {
                        state.phase = Phase::FieldValueEnd;
                    }
                }
            }
            Phase::FieldValueEnd => {
                if byte == b'\n' {
                    state.phase = Phase::FieldStart;
                }
            }
            Phase::Content | Phase::ContentTag | Phase::ContentField | Phase::Done => {}
        }
        state
    }

    fn field_name(&mut self, mut state: ParseState, byte: u8) -> ParseState {
        state.phase = Phase::FieldName;
        if byte == b'\r' {
            return state;
        }
        let (scan, field) = state.field_scan.step(byte);
        state.field_scan = scan;
        match field {
            Some(Field::Newline) => state.phase = Phase::FieldStart,
            Some(field) => {
                state.field = field;
                state.phase = Phase::FieldColon;
            }
            None => {}
        }
        state
    }

    fn field_value_start(&mut self, mut state: ParseState, byte: u8) -> ParseState {
        state.phase = Phase::FieldValueStart;
        match byte {
            b'\n' => state.phase = Phase::FieldStart,
            _ if is_space(byte) => {}
            _ => {
                state.phase = Phase::FieldValue;
                if state.field == Field::ContentLength {
                    if byte.is_ascii_digit() {
                        self.content_length_seen = true;
                        self.content_length = u64::from(byte - b'0');
                    } else {
                        self.content_length = 0;
                        state.phase = Phase::FieldValueEnd;
                    }
                }
            }
        }
        state
    }

    /// One body byte: looks for `<title ...>` and keeps the text up to the
    /// next `<`.
    fn body_step(&mut self, byte: u8) {
        match self.state.phase {
            Phase::Content => {
                if self.state.tag_scan.step(byte) {
                    self.state.phase = Phase::ContentTag;
                }
            }
            Phase::ContentTag => {
                if byte == b'>' {
                    self.title_len = 0;
                    self.state.phase = Phase::ContentField;
                }
            }
            Phase::ContentField => {
                if byte == b'<' {
                    self.state.tag_scan = TagScan::default();
                    self.state.tag_scan.step(byte);
                    self.state.phase = Phase::Content;
                } else if self.title_len < TITLE_CAPACITY {
                    self.title[self.title_len] = byte;
                    self.title_len += 1;
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error {
            return write!(f, "malformed response");
        }
        let (major, minor) = self.version();
        write!(
            f,
            "HTTP/{}.{} {}, {} body bytes",
            major,
            minor,
            self.status,
            self.content_seen()
        )
    }
}
