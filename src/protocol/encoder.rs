//! Wire encoding.
//!
//! Requests always go out as an array of bulk strings. Tokens are
//! length-prefixed, so no escaping is needed for embedded CR/LF.
//! [`encode_frame`] writes any reply frame; servers and test fixtures use
//! it, the client itself only sends requests.

use bytes::{BufMut, BytesMut};

use super::frame::Frame;

const CRLF: &[u8] = b"\r\n";

/// Append `tokens` to `out` as one RESP request frame.
///
/// The caller guarantees `tokens` is non-empty; an empty request is
/// rejected before it reaches the encoder.
pub fn encode_request<T: AsRef<[u8]>>(tokens: &[T], out: &mut BytesMut) {
    debug_assert!(!tokens.is_empty(), "empty request reached the encoder");

    out.reserve(encoded_len(tokens));
    put_header(out, b'*', tokens.len() as u64);
    for token in tokens {
        put_bulk(out, token.as_ref());
    }
}

/// Exact number of bytes [`encode_request`] will append for `tokens`.
pub fn encoded_len<T: AsRef<[u8]>>(tokens: &[T]) -> usize {
    let header = 1 + digits(tokens.len() as u64) + 2;
    tokens.iter().fold(header, |acc, token| {
        let len = token.as_ref().len();
        acc + 1 + digits(len as u64) + 2 + len + 2
    })
}

/// Append `frame` to `out` in wire form.
pub fn encode_frame(frame: &Frame, out: &mut BytesMut) {
    match frame {
        Frame::Simple(text) => put_line(out, b'+', text.as_bytes()),
        Frame::Error(message) => put_line(out, b'-', message.as_bytes()),
        Frame::Integer(n) => {
            out.put_u8(b':');
            if *n < 0 {
                out.put_u8(b'-');
            }
            put_decimal(out, n.unsigned_abs());
            out.put_slice(CRLF);
        }
        Frame::Bulk(None) => out.put_slice(b"$-1\r\n"),
        Frame::Bulk(Some(data)) => put_bulk(out, data),
        Frame::Array(None) => out.put_slice(b"*-1\r\n"),
        Frame::Array(Some(items)) => {
            put_header(out, b'*', items.len() as u64);
            for item in items {
                encode_frame(item, out);
            }
        }
    }
}

fn put_line(out: &mut BytesMut, tag: u8, line: &[u8]) {
    out.put_u8(tag);
    out.put_slice(line);
    out.put_slice(CRLF);
}

/// `<tag><len>\r\n`
fn put_header(out: &mut BytesMut, tag: u8, len: u64) {
    out.put_u8(tag);
    put_decimal(out, len);
    out.put_slice(CRLF);
}

fn put_bulk(out: &mut BytesMut, data: &[u8]) {
    put_header(out, b'$', data.len() as u64);
    out.put_slice(data);
    out.put_slice(CRLF);
}

fn digits(mut value: u64) -> usize {
    let mut count = 1;
    while value >= 10 {
        value /= 10;
        count += 1;
    }
    count
}

fn put_decimal(out: &mut BytesMut, mut value: u64) {
    // Digits go into a stack buffer to skip the String allocation.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
