//! Line-oriented chat protocol.
//!
//! Every frame is one UTF-8 line terminated by `\n`. Fields are separated by
//! a single tab, so user supplied names and chat text are sanitized before
//! they are framed.

use std::borrow::Cow;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

pub const JOIN_REQUEST_HEADER: &str = "[UNAME]";
pub const JOIN_ACK_HEADER: &str = "[ACK_CONN]";
pub const JOIN_HEADER: &str = "[NC]";
pub const LEAVE_HEADER: &str = "[DC]";
pub const CHAT_MESSAGE_HEADER: &str = "[MSG]";

const FIELD_SEPARATOR: char = '\t';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First line a client sends, carrying the display name it would like.
    JoinRequest { name: String },
    /// Server reply to a join. `users` includes `resolved_name`.
    JoinAck {
        resolved_name: String,
        users: Vec<String>,
    },
    Join { name: String },
    Leave { name: String },
    ChatMessage { name: String, text: String },
}

impl Frame {
    pub fn header(&self) -> &'static str {
        match self {
            Frame::JoinRequest { .. } => JOIN_REQUEST_HEADER,
            Frame::JoinAck { .. } => JOIN_ACK_HEADER,
            Frame::Join { .. } => JOIN_HEADER,
            Frame::Leave { .. } => LEAVE_HEADER,
            Frame::ChatMessage { .. } => CHAT_MESSAGE_HEADER,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::JoinRequest { .. } => "join_request",
            Frame::JoinAck { .. } => "join_ack",
            Frame::Join { .. } => "join",
            Frame::Leave { .. } => "leave",
            Frame::ChatMessage { .. } => "chat_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unrecognized frame header: {0}")]
    UnknownHeader(String),
    #[error("{kind} frame expects {expected} fields, got {actual}")]
    FieldCount {
        kind: &'static str,
        expected: &'static str,
        actual: usize,
    },
    #[error("{kind} frame has an empty {field}")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(String),
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
}

/// Replaces characters that would break framing. Tabs become a single space;
/// stray CR/LF are flattened the same way since they would end the line.
pub fn sanitize_field(value: &str) -> Cow<'_, str> {
    if !value.contains(['\t', '\r', '\n']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .chars()
            .map(|ch| match ch {
                '\t' | '\r' | '\n' => ' ',
                other => other,
            })
            .collect(),
    )
}

pub fn encode_frame(frame: &Frame, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut line = String::from(frame.header());
    let mut push = |value: &str| {
        line.push(FIELD_SEPARATOR);
        line.push_str(&sanitize_field(value));
    };
    match frame {
        Frame::JoinRequest { name } | Frame::Join { name } | Frame::Leave { name } => push(name),
        Frame::JoinAck {
            resolved_name,
            users,
        } => {
            push(resolved_name);
            for user in users {
                push(user);
            }
        }
        Frame::ChatMessage { name, text } => {
            push(name);
            push(text);
        }
    }
    finish_line(line, max_frame_bytes)
}

/// Encodes chat text the way a client sends it: bare text, no header.
pub fn encode_chat_line(text: &str, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    finish_line(sanitize_field(text).into_owned(), max_frame_bytes)
}

fn finish_line(line: String, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if line.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: line.len(),
            max: max_frame_bytes,
        });
    }
    let mut encoded = line.into_bytes();
    encoded.push(b'\n');
    Ok(encoded)
}

fn strip_line_ending(bytes: &[u8]) -> &[u8] {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

fn line_text(bytes: &[u8], max_frame_bytes: usize) -> Result<&str, FrameError> {
    let raw = strip_line_ending(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    std::str::from_utf8(raw).map_err(|err| FrameError::InvalidUtf8(err.to_string()))
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<Frame, FrameError> {
    let line = line_text(bytes, max_frame_bytes)?;
    if line.is_empty() {
        return Err(FrameError::Empty);
    }
    let (header, rest) = match line.split_once(FIELD_SEPARATOR) {
        Some((header, rest)) => (header, Some(rest)),
        None => (line, None),
    };

    match header {
        JOIN_REQUEST_HEADER => {
            let name = single_field("join_request", rest)?;
            Ok(Frame::JoinRequest { name })
        }
        JOIN_HEADER => {
            let name = single_field("join", rest)?;
            Ok(Frame::Join { name })
        }
        LEAVE_HEADER => {
            let name = single_field("leave", rest)?;
            Ok(Frame::Leave { name })
        }
        JOIN_ACK_HEADER => {
            let fields = rest
                .map(|rest| rest.split(FIELD_SEPARATOR).collect::<Vec<_>>())
                .unwrap_or_default();
            if fields.len() < 2 {
                return Err(FrameError::FieldCount {
                    kind: "join_ack",
                    expected: "at least 3",
                    actual: fields.len() + 1,
                });
            }
            if fields[0].is_empty() {
                return Err(FrameError::EmptyField {
                    kind: "join_ack",
                    field: "resolved name",
                });
            }
            Ok(Frame::JoinAck {
                resolved_name: fields[0].to_string(),
                users: fields[1..]
                    .iter()
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
                    .collect(),
            })
        }
        CHAT_MESSAGE_HEADER => {
            let Some((name, text)) = rest.and_then(|rest| rest.split_once(FIELD_SEPARATOR)) else {
                return Err(FrameError::FieldCount {
                    kind: "chat_message",
                    expected: "3",
                    actual: if rest.is_some() { 2 } else { 1 },
                });
            };
            if name.is_empty() {
                return Err(FrameError::EmptyField {
                    kind: "chat_message",
                    field: "name",
                });
            }
            Ok(Frame::ChatMessage {
                name: name.to_string(),
                text: sanitize_field(text).into_owned(),
            })
        }
        other => Err(FrameError::UnknownHeader(other.to_string())),
    }
}

fn single_field(kind: &'static str, rest: Option<&str>) -> Result<String, FrameError> {
    let Some(rest) = rest else {
        return Err(FrameError::FieldCount {
            kind,
            expected: "2",
            actual: 1,
        });
    };
    if rest.contains(FIELD_SEPARATOR) {
        return Err(FrameError::FieldCount {
            kind,
            expected: "2",
            actual: rest.split(FIELD_SEPARATOR).count() + 1,
        });
    }
    if rest.is_empty() {
        return Err(FrameError::EmptyField {
            kind,
            field: "name",
        });
    }
    Ok(rest.to_string())
}

/// Decodes a line of raw chat text sent by a joined client.
///
/// Returns `Ok(None)` for blank lines, which carry no message.
pub fn decode_chat_line(bytes: &[u8], max_frame_bytes: usize) -> Result<Option<String>, FrameError> {
    let line = line_text(bytes, max_frame_bytes)?;
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(sanitize_field(line).into_owned()))
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub frames: Vec<Frame>,
    pub errors: Vec<FrameError>,
}

/// Incremental decoder for a byte stream of frames. Partial lines are kept
/// until their delimiter arrives.
pub struct LineFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl LineFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if strip_line_ending(&frame).is_empty() {
                continue;
            }
            self.decode_into(&frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        if !strip_line_ending(&rest).is_empty() {
            self.decode_into(&rest, &mut report);
        }
        report
    }

    fn decode_into(&self, frame: &[u8], report: &mut DecodeReport) {
        match decode_frame(frame, self.max_frame_bytes) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(err),
        }
    }
}

impl Default for LineFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
