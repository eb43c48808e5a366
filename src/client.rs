//! TCP client over a single pipelined connection.
//!
//! [`Client`] is a thin facade: it connects, tunes the socket and hands the
//! stream to a [`Pipeline`]. The typed operations below build a request,
//! submit it and let [`FromFrame`] shape the reply; any number of tasks may
//! call them concurrently on clones of the same client.

use std::time::Duration;

use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::command::Request;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::protocol::Frame;
use crate::reply::{FromFrame, ReplyFuture};

/// Remaining time to live of a key, as reported by `TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl FromFrame for Ttl {
    fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Integer(-2) => Ok(Ttl::Missing),
            Frame::Integer(-1) => Ok(Ttl::NoExpiry),
            Frame::Integer(secs) if secs >= 0 => {
                Ok(Ttl::ExpiresIn(Duration::from_secs(secs as u64)))
            }
            other => Err(Error::UnexpectedReply(format!(
                "expected TTL integer, got {other:?}"
            ))),
        }
    }
}

/// Handle to a pipelined connection.
///
/// Clones share the connection.
#[derive(Clone)]
pub struct Client {
    pipeline: Pipeline,
    request_timeout: Option<Duration>,
}

impl Client {
    /// Connect to `config.addr` and start the pipeline.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&config.addr))
                .await
                .map_err(|_| Error::Timeout)??,
            None => TcpStream::connect(&config.addr).await?,
        };

        stream.set_nodelay(config.nodelay)?;
        if let Some(idle) = config.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        debug!(
            addr = %config.addr,
            nodelay = config.nodelay,
            keepalive = ?config.keepalive,
            "Connected"
        );

        Ok(Self::new(
            Pipeline::new(stream, config.pipeline),
            config.request_timeout,
        ))
    }

    /// Wrap an existing pipeline.
    pub fn new(pipeline: Pipeline, request_timeout: Option<Duration>) -> Self {
        Self {
            pipeline,
            request_timeout,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Submit without waiting; the reply can be awaited later.
    pub async fn submit<T: FromFrame>(&self, request: Request) -> Result<ReplyFuture<T>> {
        self.pipeline.submit(request).await
    }

    /// Submit `request` and wait for the reply, honouring the configured
    /// request timeout.
    pub async fn call<T: FromFrame>(&self, request: Request) -> Result<T> {
        match self.request_timeout {
            Some(limit) => self.call_with_timeout(request, limit).await,
            None => self.pipeline.call(request).await,
        }
    }

    /// Submit `request` and wait at most `limit` for the reply.
    ///
    /// A reply that never arrives would misalign every later one, so an
    /// elapsed deadline closes the connection and fails everything pending
    /// with [`Error::Timeout`].
    pub async fn call_with_timeout<T: FromFrame>(
        &self,
        request: Request,
        limit: Duration,
    ) -> Result<T> {
        let reply = self.pipeline.submit::<T>(request).await?;
        match tokio::time::timeout(limit, reply).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?limit, "Request timed out, closing connection");
                self.pipeline.abort(Error::Timeout);
                Err(Error::Timeout)
            }
        }
    }

    pub async fn ping(&self) -> Result<String> {
        self.call(Request::new("PING")).await
    }

    pub async fn echo(&self, message: impl AsRef<[u8]>) -> Result<Bytes> {
        self.call(Request::new("ECHO").arg(message)).await
    }

    /// Returns `None` if the key does not exist.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.call(Request::new("GET").arg(key)).await
    }

    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.call(Request::new("SET").arg(key).arg(value)).await
    }

    /// Set with an expiry, in milliseconds on the wire.
    pub async fn set_ex(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> Result<()> {
        let millis = ttl.as_millis().max(1).to_string();
        self.call(Request::new("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    /// Delete keys; returns how many existed.
    pub async fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<i64> {
        let mut request = Request::new("DEL");
        for key in keys {
            request.push_arg(key);
        }
        self.call(request).await
    }

    pub async fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.call(Request::new("EXISTS").arg(key)).await
    }

    pub async fn incr(&self, key: impl AsRef<[u8]>) -> Result<i64> {
        self.call(Request::new("INCR").arg(key)).await
    }

    /// Returns `false` if the key does not exist.
    pub async fn expire(&self, key: impl AsRef<[u8]>, ttl: Duration) -> Result<bool> {
        let secs = ttl.as_secs().to_string();
        self.call(Request::new("EXPIRE").arg(key).arg(secs)).await
    }

    pub async fn ttl(&self, key: impl AsRef<[u8]>) -> Result<Ttl> {
        self.call(Request::new("TTL").arg(key)).await
    }
}
