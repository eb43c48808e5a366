//! RESP (Redis Serialization Protocol) wire codec.
//!
//! Requests are encoded as arrays of bulk strings; replies are parsed into
//! the recursive [`Frame`] type. Only RESP2 reply types are understood.

pub mod encoder;
pub mod frame;
pub mod parser;

pub use encoder::{encode_frame, encode_request, encoded_len};
pub use frame::Frame;
pub use parser::{build, parse, parse_with, scan, ParseLimits, ParseResult, Scan};
