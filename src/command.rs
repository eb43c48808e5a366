//! Requests and commands.
//!
//! A [`Request`] is the token list a caller wants sent. A [`Command`] is a
//! request that has been bound to a result slot: it owns the tokens and a
//! one-shot resolver that converts the reply and hands it to the caller's
//! [`ReplyFuture`].
//!
//! Resolution is exactly-once by construction: `resolve` and `fail` consume
//! the command, and a command dropped without either resolves its slot
//! with [`Error::Closed`].

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::reply::{FromFrame, ReplyFuture};

/// Ordered request tokens: command name followed by its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    tokens: Vec<Bytes>,
}

impl Request {
    /// Start a request with the command name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            tokens: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Build a request from a complete token list.
    ///
    /// An empty list is accepted here and rejected at submit time.
    pub fn from_tokens<I, A>(tokens: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|token| Bytes::copy_from_slice(token.as_ref()))
                .collect(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.push_arg(arg);
        self
    }

    /// Append an argument in place.
    pub fn push_arg(&mut self, arg: impl AsRef<[u8]>) {
        self.tokens.push(Bytes::copy_from_slice(arg.as_ref()));
    }

    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    /// The command name, if any.
    pub fn name(&self) -> Option<&[u8]> {
        self.tokens.first().map(|token| &token[..])
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

type Resolver = Box<dyn FnOnce(Result<Frame>) + Send>;

/// A request bound to its result slot, as it travels through the pipeline.
pub struct Command {
    tokens: Vec<Bytes>,
    resolver: Option<Resolver>,
}

impl Command {
    /// Bind `request` to a fresh result slot interpreting the reply as `T`.
    ///
    /// Fails with [`Error::EmptyRequest`] if the request has no tokens.
    pub fn new<T: FromFrame>(request: Request) -> Result<(Command, ReplyFuture<T>)> {
        if request.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let (tx, rx) = oneshot::channel();
        let resolver: Resolver = Box::new(move |outcome: Result<Frame>| {
            let value = outcome.and_then(|frame| match frame {
                Frame::Error(message) => Err(Error::Server(message)),
                frame => T::from_frame(frame),
            });
            // The caller may have stopped waiting.
            let _ = tx.send(value);
        });

        let command = Command {
            tokens: request.tokens,
            resolver: Some(resolver),
        };
        Ok((command, ReplyFuture::new(rx)))
    }

    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    /// Resolve with the reply frame matched to this command.
    pub fn resolve(mut self, frame: Frame) {
        self.complete(Ok(frame));
    }

    /// Resolve with a failure.
    pub fn fail(mut self, err: Error) {
        self.complete(Err(err));
    }

    fn complete(&mut self, outcome: Result<Frame>) {
        if let Some(resolver) = self.resolver.take() {
            resolver(outcome);
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.complete(Err(Error::Closed));
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .tokens
            .first()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default();
        f.debug_struct("Command")
            .field("name", &name)
            .field("args", &self.tokens.len().saturating_sub(1))
            .field("resolved", &self.resolver.is_none())
            .finish()
    }
}
