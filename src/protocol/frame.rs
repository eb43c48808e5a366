//! RESP2 reply frames.

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::encoder::encode_frame;

/// RESP frame types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n or $-1\r\n (nil)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n... or *-1\r\n (nil)
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Wire form of this frame.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(self, &mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_frame(self, buf);
    }

    /// Create a simple string frame
    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    /// Create an error frame
    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    /// Create a nil bulk string frame
    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    /// Create a bulk string frame
    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    /// Create an integer frame
    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    /// Create an array frame
    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(Some(frames))
    }

    /// True for `$-1` and `*-1`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Frame::Bulk(None) | Frame::Array(None))
    }

    /// Short type name used in conversion errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(None) => "nil bulk string",
            Frame::Bulk(Some(_)) => "bulk string",
            Frame::Array(None) => "nil array",
            Frame::Array(Some(_)) => "array",
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "{s}"),
            Frame::Error(s) => write!(f, "(error) {s}"),
            Frame::Integer(n) => write!(f, "(integer) {n}"),
            Frame::Bulk(None) | Frame::Array(None) => write!(f, "(nil)"),
            Frame::Bulk(Some(data)) => write!(f, "\"{}\"", data.escape_ascii()),
            Frame::Array(Some(items)) if items.is_empty() => write!(f, "(empty array)"),
            Frame::Array(Some(items)) => {
                let width = items.len().to_string().len();
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "\n{:indent$}", "")?;
                    }
                    write!(f, "{:>width$}) ", idx + 1)?;
                    item.fmt_indented(f, indent + width + 2)?;
                }
                Ok(())
            }
        }
    }
}

/// Renders replies the way `redis-cli` prints them.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
