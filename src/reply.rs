//! Reply interpretation and result slots.
//!
//! [`FromFrame`] turns a decoded [`Frame`] into a caller's typed result.
//! [`ReplyFuture`] is the caller's end of a command's single-assignment
//! result slot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Conversion from a decoded reply frame.
///
/// Error frames never reach this trait; they are turned into
/// [`Error::Server`] before conversion. Nested error frames inside an
/// array are passed through as [`Frame::Error`].
pub trait FromFrame: Sized + Send + 'static {
    fn from_frame(frame: Frame) -> Result<Self>;
}

fn unexpected<T>(expected: &str, frame: &Frame) -> Result<T> {
    Err(Error::UnexpectedReply(format!(
        "expected {expected}, got {}",
        frame.kind()
    )))
}

impl FromFrame for Frame {
    fn from_frame(frame: Frame) -> Result<Self> {
        Ok(frame)
    }
}

/// Accepts any status reply, e.g. `+OK`.
impl FromFrame for () {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Simple(_) => Ok(()),
            other => unexpected("status reply", &other),
        }
    }
}

impl FromFrame for Bytes {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Bulk(Some(data)) => Ok(data),
            Frame::Simple(s) => Ok(Bytes::from(s)),
            other => unexpected("bulk string", &other),
        }
    }
}

impl FromFrame for String {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(Some(data)) => String::from_utf8(data.to_vec())
                .map_err(|_| Error::UnexpectedReply("bulk string is not valid UTF-8".into())),
            Frame::Integer(n) => Ok(n.to_string()),
            other => unexpected("string", &other),
        }
    }
}

impl FromFrame for i64 {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(n) => Ok(n),
            Frame::Bulk(Some(ref data)) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::UnexpectedReply("bulk string is not an integer".into())),
            other => unexpected("integer", &other),
        }
    }
}

/// `:0` is false, any other integer true; `+OK` is true.
impl FromFrame for bool {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(n) => Ok(n != 0),
            Frame::Simple(_) => Ok(true),
            Frame::Bulk(None) => Ok(false),
            other => unexpected("integer or status", &other),
        }
    }
}

/// `$-1` and `*-1` map to `None`.
impl<T: FromFrame> FromFrame for Option<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        if frame.is_nil() {
            return Ok(None);
        }
        T::from_frame(frame).map(Some)
    }
}

impl<T: FromFrame> FromFrame for Vec<T> {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Array(Some(items)) => items.into_iter().map(T::from_frame).collect(),
            Frame::Array(None) => Ok(Vec::new()),
            other => unexpected("array", &other),
        }
    }
}

/// Caller's end of a command's result slot.
///
/// Resolves exactly once: with the converted reply, a server error, or the
/// fault that ended the connection. Dropping it is allowed at any time;
/// the reply is still read off the wire and discarded.
#[must_use = "dropping a ReplyFuture discards the reply"]
#[derive(Debug)]
pub struct ReplyFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ReplyFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// Take the result if it has arrived, without waiting.
    ///
    /// Returns `None` while the reply is outstanding. Once a result has
    /// been taken, later calls report [`Error::Closed`].
    pub fn try_recv(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }

    /// Wait at most `duration` for the reply.
    ///
    /// Elapsing only stops this caller from waiting; the connection keeps
    /// the command queued. Use `Client::call_with_timeout` to treat the
    /// deadline as fatal for the connection.
    pub async fn timeout(self, duration: Duration) -> Result<T> {
        match tokio::time::timeout(duration, self).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl<T> Future for ReplyFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Closed)))
    }
}
