//! Line-oriented hex frame codec.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────────────┬──────────────┬──────┐
//! │ payload (hex, 2 chars/byte)  │ CRC-8 (hex)  │ '\n' │
//! └──────────────────────────────┴──────────────┴──────┘
//!            <annotation text> may appear anywhere
//! ```
//!
//! The decoder accumulates hex digits until the line terminator, then
//! validates the trailing CRC-8/MAXIM byte.  Text between `<` and `>` is
//! an annotation: `!`-prefixed annotations are controller events, the rest
//! are controller log lines.  Annotations nest (`<a <b> >` yields `b`, then
//! `a`) up to [`MAX_ANNOTATION_DEPTH`] levels.  A line that grows past the
//! configured maximum is discarded byte by byte until the next terminator,
//! so an oversize frame never occupies more than the maximum in memory.
//!
//! An annotation that overflows its buffer (a stray `<` with no closing
//! `>`) is reported at once and the decoder drops back to data mode,
//! discarding the rest of the current line.
//!
//! Corruption is reported as [`FrameEvent::Corrupt`], never as an error:
//! the next `'\n'` always resynchronizes the stream.

use core::fmt;

/// Default maximum frame payload size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Annotations longer than this are dropped.
pub const MAX_ANNOTATION_LEN: usize = 256;

/// Deepest annotation nesting accepted.
pub const MAX_ANNOTATION_DEPTH: usize = 4;

const FRAME_END: u8 = b'\n';
const ANNOTATION_START: u8 = b'<';
const ANNOTATION_END: u8 = b'>';
const EVENT_MARKER: char = '!';
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

// ── Checksum ─────────────────────────────────────────────────

/// CRC-8/MAXIM (Dallas 1-Wire), reflected polynomial 0x8C, init 0.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| {
        let mut crc = crc ^ byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0x8C
            } else {
                crc >> 1
            };
        }
        crc
    })
}

// ── Decoded events ───────────────────────────────────────────

/// A checksum-validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    checksum: u8,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }
}

/// Why a line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// A character outside `[0-9A-Fa-f]`.
    InvalidDigit(u8),
    /// An odd number of hex digits.
    OddLength,
    /// Fewer bytes than the checksum itself.
    Truncated,
    /// Checksum mismatch.
    Checksum { expected: u8, actual: u8 },
    /// The line exceeded the maximum frame size.
    Oversize,
    /// An annotation exceeded [`MAX_ANNOTATION_LEN`] or
    /// [`MAX_ANNOTATION_DEPTH`].
    AnnotationOversize,
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDigit(b) => write!(f, "invalid hex digit 0x{b:02X}"),
            Self::OddLength => write!(f, "odd number of hex digits"),
            Self::Truncated => write!(f, "frame shorter than its checksum"),
            Self::Checksum { expected, actual } => {
                write!(f, "checksum 0x{actual:02X}, expected 0x{expected:02X}")
            }
            Self::Oversize => write!(f, "frame exceeds maximum size"),
            Self::AnnotationOversize => write!(f, "annotation exceeds maximum size"),
        }
    }
}

/// Annotation text found between `<` and `>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// `!`-prefixed controller event (marker stripped).
    Event(String),
    /// Free-form controller log line.
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Frame),
    Annotation(Annotation),
    Corrupt(FrameFault),
}

// ── Decoder ──────────────────────────────────────────────────

/// Streaming frame decoder.
///
/// Parser state survives between [`feed`](Self::feed) calls, so bytes may
/// arrive one at a time or many frames at once.
pub struct FrameDecoder {
    max_frame_size: usize,
    line: Vec<u8>,
    fault: Option<FrameFault>,
    /// Fault already reported; drop input until the next terminator.
    discarding: bool,
    /// Open annotations, innermost last.
    annotations: heapless::Vec<heapless::Vec<u8, MAX_ANNOTATION_LEN>, MAX_ANNOTATION_DEPTH>,
    backlog: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            line: Vec::new(),
            fault: None,
            discarding: false,
            annotations: heapless::Vec::new(),
            backlog: Vec::new(),
        }
    }

    /// Feed bytes into the decoder.
    ///
    /// Events are produced lazily.  Input the iterator has not consumed
    /// when dropped is kept and processed first by the next call.
    pub fn feed<'a>(&'a mut self, data: &'a [u8]) -> Frames<'a> {
        let backlog = core::mem::take(&mut self.backlog);
        Frames {
            decoder: self,
            backlog,
            backlog_pos: 0,
            data,
            data_pos: 0,
        }
    }

    /// Reset decoder state (e.g. after a transport reconnect).
    pub fn reset(&mut self) {
        self.line.clear();
        self.fault = None;
        self.discarding = false;
        self.annotations.clear();
        self.backlog.clear();
    }

    /// Longest hex line accepted: payload plus checksum byte.
    fn max_line_digits(&self) -> usize {
        (self.max_frame_size + 1) * 2
    }

    fn push_byte(&mut self, byte: u8) -> Option<FrameEvent> {
        if !self.annotations.is_empty() {
            return self.push_annotation_byte(byte);
        }

        match byte {
            ANNOTATION_START => self.open_annotation(),
            FRAME_END if self.discarding => {
                self.discarding = false;
                self.line.clear();
                None
            }
            FRAME_END => self.finish_line(),
            b'\r' | b' ' | b'\t' => None,
            _ if self.discarding || self.fault.is_some() => None,
            _ if !byte.is_ascii_hexdigit() => {
                self.fault = Some(FrameFault::InvalidDigit(byte));
                self.line.clear();
                None
            }
            _ if self.line.len() >= self.max_line_digits() => {
                self.fault = Some(FrameFault::Oversize);
                self.line = Vec::new();
                None
            }
            _ => {
                self.line.push(byte);
                None
            }
        }
    }

    fn open_annotation(&mut self) -> Option<FrameEvent> {
        if self.annotations.push(heapless::Vec::new()).is_err() {
            return Some(self.annotation_overflow());
        }
        None
    }

    fn push_annotation_byte(&mut self, byte: u8) -> Option<FrameEvent> {
        match byte {
            ANNOTATION_START => self.open_annotation(),
            ANNOTATION_END => self.close_annotation(),
            _ => {
                let buf = self.annotations.last_mut()?;
                if buf.push(byte).is_err() {
                    return Some(self.annotation_overflow());
                }
                None
            }
        }
    }

    /// Abandon every open annotation and the line it interrupted.
    fn annotation_overflow(&mut self) -> FrameEvent {
        self.annotations.clear();
        self.line.clear();
        self.fault = None;
        self.discarding = true;
        FrameEvent::Corrupt(FrameFault::AnnotationOversize)
    }

    fn close_annotation(&mut self) -> Option<FrameEvent> {
        let buf = self.annotations.pop()?;
        let text = String::from_utf8_lossy(&buf).trim().to_string();
        let annotation = match text.strip_prefix(EVENT_MARKER) {
            Some(event) => Annotation::Event(event.to_string()),
            None => Annotation::Log(text),
        };
        Some(FrameEvent::Annotation(annotation))
    }

    fn finish_line(&mut self) -> Option<FrameEvent> {
        if let Some(fault) = self.fault.take() {
            self.line.clear();
            return Some(FrameEvent::Corrupt(fault));
        }
        if self.line.is_empty() {
            return None;
        }

        let digits = core::mem::take(&mut self.line);
        Some(match decode_line(&digits) {
            Ok(frame) => FrameEvent::Frame(frame),
            Err(fault) => FrameEvent::Corrupt(fault),
        })
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

fn decode_line(digits: &[u8]) -> Result<Frame, FrameFault> {
    if digits.len() % 2 != 0 {
        return Err(FrameFault::OddLength);
    }
    let mut bytes: Vec<u8> = digits
        .chunks_exact(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect();

    let checksum = bytes.pop().ok_or(FrameFault::Truncated)?;
    let expected = crc8(&bytes);
    if expected != checksum {
        return Err(FrameFault::Checksum {
            expected,
            actual: checksum,
        });
    }

    Ok(Frame {
        payload: bytes,
        checksum,
    })
}

/// Lazy event iterator returned by [`FrameDecoder::feed`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    backlog: Vec<u8>,
    backlog_pos: usize,
    data: &'a [u8],
    data_pos: usize,
}

impl Iterator for Frames<'_> {
    type Item = FrameEvent;

    fn next(&mut self) -> Option<FrameEvent> {
        while self.backlog_pos < self.backlog.len() {
            let byte = self.backlog[self.backlog_pos];
            self.backlog_pos += 1;
            if let Some(event) = self.decoder.push_byte(byte) {
                return Some(event);
            }
        }
        while self.data_pos < self.data.len() {
            let byte = self.data[self.data_pos];
            self.data_pos += 1;
            if let Some(event) = self.decoder.push_byte(byte) {
                return Some(event);
            }
        }
        None
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        let mut rest = self.backlog.split_off(self.backlog_pos.min(self.backlog.len()));
        rest.extend_from_slice(&self.data[self.data_pos..]);
        self.decoder.backlog = rest;
    }
}

// ── Encoder ──────────────────────────────────────────────────

/// Encode a payload into a terminated hex line with its checksum.
///
/// Returns `None` when the payload exceeds `max_frame_size`.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Option<Vec<u8>> {
    if payload.len() > max_frame_size {
        return None;
    }

    let mut out = Vec::with_capacity((payload.len() + 1) * 2 + 1);
    for &byte in payload.iter().chain(core::iter::once(&crc8(payload))) {
        out.push(HEX_DIGITS[(byte >> 4) as usize]);
        out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
    }
    out.push(FRAME_END);
    Some(out)
}

/// Encode an annotation for the wire (used by the simulated controller).
pub fn encode_annotation(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(ANNOTATION_START);
    out.extend_from_slice(text.as_bytes());
    out.push(ANNOTATION_END);
    out
}
