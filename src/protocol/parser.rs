//! RESP reply parser.
//!
//! Parsing happens in two steps. [`scan`] walks the front of a byte
//! buffer without allocating and reports whether one complete frame is
//! there; when it is not, it reports how many bytes must be buffered
//! before another attempt can succeed. [`build`] then turns exactly those
//! bytes into a [`Frame`], slicing bulk payloads out of them instead of
//! copying.
//!
//! Nothing is consumed by an incomplete attempt. Arrays are scanned again
//! from their header on the next attempt, but only once the missing bytes
//! have arrived.

use bytes::Bytes;
use serde::Deserialize;

use super::frame::Frame;

/// Default cap on a single bulk string (matches the server's proto-max-bulk-len).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default cap on array nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Nesting never goes deeper than this, whatever `max_depth` says; both
/// passes recurse once per level.
pub const MAX_DEPTH_CEILING: usize = 128;

/// Default cap on elements in a single array.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Bounds applied while parsing untrusted replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParseLimits {
    /// Largest accepted bulk string payload in bytes.
    pub max_bulk_len: usize,
    /// Deepest accepted array nesting, capped at [`MAX_DEPTH_CEILING`].
    pub max_depth: usize,
    /// Largest accepted element count for one array.
    pub max_array_len: usize,
}

impl ParseLimits {
    /// Nesting limit actually enforced.
    pub fn effective_depth(&self) -> usize {
        self.max_depth.min(MAX_DEPTH_CEILING)
    }
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// Framing violation; the stream cannot be resynchronized
    Error(String),
}

/// Outcome of [`scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// One complete, valid frame occupies this many leading bytes.
    Complete(usize),
    /// No attempt can succeed before the buffer holds this many bytes.
    Incomplete(usize),
    /// Framing violation; the stream cannot be resynchronized
    Error(String),
}

/// Parse a RESP frame from a buffer using the default limits
pub fn parse(buffer: &[u8]) -> ParseResult {
    parse_with(buffer, &ParseLimits::default())
}

/// Parse a RESP frame from a buffer.
///
/// Payloads are copied out of `buffer`; [`scan`] followed by [`build`] on
/// a frozen buffer avoids that.
pub fn parse_with(buffer: &[u8], limits: &ParseLimits) -> ParseResult {
    match scan(buffer, limits) {
        Scan::Complete(len) => match build(&Bytes::copy_from_slice(&buffer[..len])) {
            Ok(frame) => ParseResult::Complete(frame, len),
            Err(e) => ParseResult::Error(e),
        },
        Scan::Incomplete(_) => ParseResult::Incomplete,
        Scan::Error(e) => ParseResult::Error(e),
    }
}

/// Check whether `buffer` starts with one complete, valid frame.
pub fn scan(buffer: &[u8], limits: &ParseLimits) -> Scan {
    scan_frame(buffer, 0, limits, 0)
}

/// Build the frame held in `src`, which must be exactly the bytes that
/// [`scan`] reported as [`Scan::Complete`].
pub fn build(src: &Bytes) -> Result<Frame, String> {
    let (frame, end) = build_frame(src, 0)?;
    if end != src.len() {
        return Err(format!("{} trailing bytes after frame", src.len() - end));
    }
    Ok(frame)
}

fn scan_frame(buffer: &[u8], start: usize, limits: &ParseLimits, depth: usize) -> Scan {
    let Some(&tag) = buffer.get(start) else {
        return Scan::Incomplete(start + 1);
    };
    if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
        return Scan::Error(unknown_tag(tag));
    }
    let Some((line, next)) = read_line(buffer, start) else {
        return Scan::Incomplete(buffer.len() + 1);
    };

    match tag {
        b'+' => match parse_text(line, "simple string") {
            Ok(_) => Scan::Complete(next),
            Err(e) => Scan::Error(e),
        },
        // Error text is informational; don't kill the connection over bad UTF-8.
        b'-' => Scan::Complete(next),
        b':' => match parse_decimal(line, "integer") {
            Ok(_) => Scan::Complete(next),
            Err(e) => Scan::Error(e),
        },
        b'$' => match parse_length(line, "bulk string", limits.max_bulk_len) {
            Ok(None) => Scan::Complete(next),
            Ok(Some(len)) => {
                let end = next + len + 2;
                if buffer.len() < end {
                    Scan::Incomplete(end)
                } else if &buffer[end - 2..end] != b"\r\n" {
                    Scan::Error("Bulk string missing trailing CRLF".to_string())
                } else {
                    Scan::Complete(end)
                }
            }
            Err(e) => Scan::Error(e),
        },
        _ => match parse_length(line, "array", limits.max_array_len) {
            Ok(None) => Scan::Complete(next),
            Ok(Some(_)) if depth >= limits.effective_depth() => Scan::Error(format!(
                "Array nesting exceeds maximum depth {}",
                limits.effective_depth()
            )),
            Ok(Some(len)) => {
                let mut offset = next;
                for _ in 0..len {
                    match scan_frame(buffer, offset, limits, depth + 1) {
                        Scan::Complete(end) => offset = end,
                        other => return other,
                    }
                }
                Scan::Complete(offset)
            }
            Err(e) => Scan::Error(e),
        },
    }
}

/// Returns the frame starting at `start` and the offset just past it.
fn build_frame(src: &Bytes, start: usize) -> Result<(Frame, usize), String> {
    let (line, next) = read_line(src, start).ok_or_else(|| "Truncated frame".to_string())?;

    let frame = match src[start] {
        b'+' => Frame::Simple(parse_text(line, "simple string")?),
        b'-' => Frame::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => Frame::Integer(parse_decimal(line, "integer")?),
        b'$' => match parse_length(line, "bulk string", usize::MAX)? {
            None => Frame::Bulk(None),
            Some(len) => {
                let end = next + len;
                if end + 2 > src.len() {
                    return Err("Truncated bulk string".to_string());
                }
                return Ok((Frame::Bulk(Some(src.slice(next..end))), end + 2));
            }
        },
        b'*' => match parse_length(line, "array", usize::MAX)? {
            None => Frame::Array(None),
            Some(len) => {
                let mut offset = next;
                // Cap the preallocation; the element count comes off the wire.
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let (item, end) = build_frame(src, offset)?;
                    items.push(item);
                    offset = end;
                }
                return Ok((Frame::Array(Some(items)), offset));
            }
        },
        tag => return Err(unknown_tag(tag)),
    };
    Ok((frame, next))
}

fn unknown_tag(tag: u8) -> String {
    format!("Unknown frame type: {:?}", tag as char)
}

/// Find CRLF in buffer, return position of \r
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Read the line after the tag byte at `start`; returns the line and the
/// offset just past its CRLF.
fn read_line(buffer: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let body = start + 1;
    let rest = buffer.get(body..)?;
    find_crlf(rest).map(|len| (&rest[..len], body + len + 2))
}

fn parse_text(line: &[u8], what: &str) -> Result<String, String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| format!("Invalid UTF-8 in {what}"))
}

fn parse_decimal(line: &[u8], what: &str) -> Result<i64, String> {
    let s = std::str::from_utf8(line).map_err(|_| format!("Invalid UTF-8 in {what}"))?;
    s.parse::<i64>().map_err(|_| format!("Invalid {what}: {s:?}"))
}

/// Length header of a bulk string or array; `None` is the nil sentinel.
fn parse_length(line: &[u8], what: &str, max: usize) -> Result<Option<usize>, String> {
    match parse_decimal(line, &format!("{what} length"))? {
        -1 => Ok(None),
        n if n < -1 => Err(format!("Invalid {what} length: {n}")),
        n if n as u64 > max as u64 => Err(format!("{what} length {n} exceeds maximum {max}")),
        n => Ok(Some(n as usize)),
    }
}
