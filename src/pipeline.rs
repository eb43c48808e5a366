//! Per-connection request/response pipeline.
//!
//! One task owns the transport, the outbound buffer, the pending queue and
//! the decoder for a connection, so none of them need locking. Callers on
//! any thread hand commands to that task over a bounded channel.
//!
//! ```text
//! caller 1 ─┐                         ┌─► outbound buffer ─► transport
//! caller 2 ─┼─► mpsc<Command> ─► task ┤   (encode + push, one step)
//! caller N ─┘                         └─◄ decoder ◄───────── transport
//!                                          (pop head per frame)
//! ```
//!
//! Receiving a command appends its request frame to the outbound buffer
//! and pushes it onto the pending queue in the same synchronous step, so
//! queue order is always wire order. Reads, writes and hand-off receipt
//! are multiplexed so a large outbound batch never stops replies from
//! being consumed.
//!
//! Any framing or transport fault ends the connection: every pending
//! command and every command still waiting in the hand-off channel is
//! failed with the fault, and later submits fail with [`Error::Closed`].

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::command::{Command, Request};
use crate::config::PipelineConfig;
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::protocol::encode_request;
use crate::queue::PendingQueue;
use crate::reply::{FromFrame, ReplyFuture};

/// Spare room kept in the accumulation buffer before each read.
const READ_RESERVE: usize = 4 * 1024;

/// Handle to a running pipeline.
///
/// Cheap to clone; every clone submits into the same connection. The
/// connection task exits once all handles are dropped and every
/// outstanding reply has been read.
#[derive(Clone)]
pub struct Pipeline {
    tx: mpsc::Sender<Command>,
    abort: Arc<watch::Sender<Option<Error>>>,
    closed: watch::Receiver<Option<Error>>,
}

impl Pipeline {
    /// Start a pipeline over `transport` on the current tokio runtime.
    pub fn new<T>(transport: T, config: PipelineConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (abort_tx, abort_rx) = watch::channel(None);
        let (closed_tx, closed_rx) = watch::channel(None);

        let (reader, writer) = tokio::io::split(transport);
        let connection = Connection {
            reader,
            writer,
            rx,
            abort: abort_rx,
            closed: closed_tx,
            queue: PendingQueue::new(),
            decoder: Decoder::with_capacity(config.read_buffer_capacity, config.limits),
            outbound: BytesMut::with_capacity(config.read_buffer_capacity),
            config,
        };
        tokio::spawn(connection.run());

        Self {
            tx,
            abort: Arc::new(abort_tx),
            closed: closed_rx,
        }
    }

    /// Hand `request` to the connection and return its result slot.
    ///
    /// Waits only if the hand-off channel is full. The returned future may
    /// be dropped at any point; the reply is still consumed in order.
    pub async fn submit<T: FromFrame>(&self, request: Request) -> Result<ReplyFuture<T>> {
        let (command, reply) = Command::new::<T>(request)?;
        trace!(?command, "Submitting");
        self.tx.send(command).await.map_err(|_| Error::Closed)?;
        Ok(reply)
    }

    /// Submit `request` and wait for its reply.
    pub async fn call<T: FromFrame>(&self, request: Request) -> Result<T> {
        self.submit(request).await?.await
    }

    /// Tear the connection down with `reason` as the fault.
    ///
    /// Meant for supervisors, e.g. after a deadline: a reply that was not
    /// waited for cannot be skipped, so the whole connection goes.
    pub fn abort(&self, reason: Error) {
        self.abort.send_replace(Some(reason));
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// The fault that ended the connection, if it has ended.
    pub fn fault(&self) -> Option<Error> {
        self.closed.borrow().clone()
    }

    /// Wait until the connection is torn down and return the fault.
    pub async fn closed(&self) -> Error {
        let mut closed = self.closed.clone();
        let fault = match closed.wait_for(Option::is_some).await {
            Ok(fault) => fault.clone(),
            Err(_) => None,
        };
        fault.unwrap_or(Error::Closed)
    }
}

/// Connection-scoped state, owned by the connection task.
struct Connection<T> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    rx: mpsc::Receiver<Command>,
    abort: watch::Receiver<Option<Error>>,
    closed: watch::Sender<Option<Error>>,
    queue: PendingQueue,
    decoder: Decoder,
    /// Encoded requests not yet accepted by the transport.
    outbound: BytesMut,
    config: PipelineConfig,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        let fault = match self.drive().await {
            Ok(()) => {
                debug!("Connection finished");
                Error::Closed
            }
            Err(fault) => {
                warn!(error = %fault, pending = self.queue.len(), "Connection failed");
                fault
            }
        };
        self.teardown(fault);
    }

    async fn drive(&mut self) -> Result<()> {
        let mut accepting = true;
        let mut abortable = true;
        // Bytes handed to the transport since the last completed flush.
        let mut unflushed = false;

        loop {
            if !accepting && self.queue.is_empty() && self.outbound.is_empty() {
                return Ok(());
            }

            // An empty buffer always takes one more batch, whatever the limit.
            let can_accept = accepting
                && (self.outbound.is_empty()
                    || self.outbound.len() < self.config.max_outbound_buffer);
            self.decoder.buffer_mut().reserve(READ_RESERVE);

            tokio::select! {
                biased;

                changed = self.abort.changed(), if abortable => {
                    if changed.is_err() {
                        // Every handle is gone; nobody can abort any more.
                        abortable = false;
                        continue;
                    }
                    if let Some(reason) = self.abort.borrow_and_update().clone() {
                        return Err(reason);
                    }
                }

                read = self.reader.read_buf(self.decoder.buffer_mut()) => {
                    if read? == 0 {
                        if self.queue.is_empty() && self.outbound.is_empty() {
                            debug!("Peer closed the connection");
                            return Ok(());
                        }
                        return Err(Error::Closed);
                    }
                    let resolved = self.decoder.decode(&mut self.queue)?;
                    trace!(resolved, pending = self.queue.len(), buffered = self.decoder.len(), "Decoded");
                }

                written = write_or_flush(&mut self.writer, &mut self.outbound),
                    if !self.outbound.is_empty() || unflushed =>
                {
                    match written? {
                        Some(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                        Some(_) => unflushed = true,
                        None => unflushed = false,
                    }
                }

                command = self.rx.recv(), if can_accept => match command {
                    Some(command) => {
                        self.enqueue(command);
                        for _ in 1..self.config.max_batch {
                            match self.rx.try_recv() {
                                Ok(command) => self.enqueue(command),
                                Err(_) => break,
                            }
                        }
                    }
                    None => {
                        debug!(pending = self.queue.len(), "All handles dropped, draining");
                        accepting = false;
                    }
                },
            }
        }
    }

    /// Encode `command` into the outbound buffer and record it as pending.
    fn enqueue(&mut self, command: Command) {
        encode_request(command.tokens(), &mut self.outbound);
        self.queue.push(command);
    }

    fn teardown(&mut self, fault: Error) {
        self.rx.close();

        let failed = self.queue.fail_all(&fault);
        let mut unsent = 0;
        while let Ok(command) = self.rx.try_recv() {
            command.fail(fault.clone());
            unsent += 1;
        }
        debug!(error = %fault, failed, unsent, "Connection torn down");

        self.closed.send_replace(Some(fault));
    }
}

/// Write part of `outbound`, or flush the transport once all of it has
/// been written. `None` means a flush completed.
async fn write_or_flush<W>(writer: &mut W, outbound: &mut BytesMut) -> io::Result<Option<usize>>
where
    W: AsyncWrite + Unpin,
{
    if outbound.is_empty() {
        writer.flush().await?;
        Ok(None)
    } else {
        writer.write_buf(outbound).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse, Frame, ParseResult};
    use bytes::{Buf, Bytes};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::task::JoinHandle;

    fn request_bytes(request: &Request) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_request(request.tokens(), &mut buf);
        buf.to_vec()
    }

    async fn expect_request(server: &mut DuplexStream, request: &Request) {
        let expected = request_bytes(request);
        let mut actual = vec![0u8; expected.len()];
        server.read_exact(&mut actual).await.unwrap();
        assert_eq!(actual, expected);
    }

    /// Answers every request with `handler(tokens)` as soon as it is parsed.
    fn spawn_server<F>(mut io: DuplexStream, handler: F) -> JoinHandle<()>
    where
        F: Fn(Vec<Bytes>) -> Frame + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            loop {
                match io.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                while let ParseResult::Complete(frame, consumed) = parse(&buf) {
                    buf.advance(consumed);
                    let tokens = match frame {
                        Frame::Array(Some(items)) => items
                            .into_iter()
                            .map(|item| match item {
                                Frame::Bulk(Some(token)) => token,
                                other => panic!("Expected bulk token, got {other:?}"),
                            })
                            .collect(),
                        other => panic!("Expected request array, got {other:?}"),
                    };
                    if io.write_all(&handler(tokens).encode()).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn echo(tokens: Vec<Bytes>) -> Frame {
        match tokens.get(1) {
            Some(arg) => Frame::bulk(arg.clone()),
            None => Frame::simple("PONG"),
        }
    }

    #[tokio::test]
    async fn test_write_then_simple_ok() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let request = Request::new("SET").arg("key").arg("value");
        let reply = pipeline.submit::<Frame>(request.clone()).await.unwrap();

        expect_request(&mut server, &request).await;
        server.write_all(b"+OK\r\n").await.unwrap();

        assert_eq!(reply.await.unwrap(), Frame::simple("OK"));
        assert!(!pipeline.is_closed());
    }

    #[tokio::test]
    async fn test_fifo_with_concatenated_replies() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let mut requests = Vec::new();
        let mut replies = Vec::new();
        for i in 0..50 {
            let request = Request::new("ECHO").arg(format!("value-{i}"));
            replies.push(pipeline.submit::<String>(request.clone()).await.unwrap());
            requests.push(request);
        }

        for request in &requests {
            expect_request(&mut server, request).await;
        }

        let mut chunk = BytesMut::new();
        for i in 0..50 {
            Frame::bulk(format!("value-{i}")).encode_into(&mut chunk);
        }
        server.write_all(&chunk).await.unwrap();

        for (i, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply.await.unwrap(), format!("value-{i}"));
        }
    }

    #[tokio::test]
    async fn test_bulk_split_across_deliveries() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let request = Request::new("GET").arg("greeting");
        let mut reply = pipeline.submit::<Option<Bytes>>(request.clone()).await.unwrap();
        expect_request(&mut server, &request).await;

        server.write_all(b"$11\r\nhello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reply.try_recv().is_none());

        server.write_all(b" world\r\n").await.unwrap();
        assert_eq!(reply.await.unwrap(), Some(Bytes::from_static(b"hello world")));
    }

    #[tokio::test]
    async fn test_nil_reply() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let missing = pipeline.submit::<Option<String>>(Request::new("GET").arg("a")).await.unwrap();
        let empty = pipeline.submit::<Option<String>>(Request::new("GET").arg("b")).await.unwrap();
        // Replying before both requests are on the wire would be unsolicited.
        expect_request(&mut server, &Request::new("GET").arg("a")).await;
        expect_request(&mut server, &Request::new("GET").arg("b")).await;
        server.write_all(b"$-1\r\n$0\r\n\r\n").await.unwrap();

        assert_eq!(missing.await.unwrap(), None);
        assert_eq!(empty.await.unwrap(), Some(String::new()));
    }

    #[tokio::test]
    async fn test_server_error_does_not_break_neighbours() {
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());
        spawn_server(server, |tokens| match &tokens[0][..] {
            b"INCR" => Frame::error("ERR value is not an integer or out of range"),
            _ => echo(tokens),
        });

        let first = pipeline.submit::<String>(Request::new("ECHO").arg("a")).await.unwrap();
        let second = pipeline.submit::<i64>(Request::new("INCR").arg("k")).await.unwrap();
        let third = pipeline.submit::<String>(Request::new("ECHO").arg("c")).await.unwrap();

        assert_eq!(first.await.unwrap(), "a");
        assert!(matches!(second.await, Err(Error::Server(_))));
        assert_eq!(third.await.unwrap(), "c");

        assert_eq!(pipeline.call::<String>(Request::new("PING")).await.unwrap(), "PONG");
        assert!(!pipeline.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_tag_tears_down_connection() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let first = pipeline.submit::<Frame>(Request::new("PING")).await.unwrap();
        let second = pipeline.submit::<Frame>(Request::new("PING")).await.unwrap();
        let third = pipeline.submit::<Frame>(Request::new("PING")).await.unwrap();
        for _ in 0..3 {
            expect_request(&mut server, &Request::new("PING")).await;
        }

        server.write_all(b"+PONG\r\n%oops\r\n+PONG\r\n").await.unwrap();

        assert_eq!(first.await.unwrap(), Frame::simple("PONG"));
        assert!(matches!(second.await, Err(Error::Protocol(_))));
        assert!(matches!(third.await, Err(Error::Protocol(_))));
        assert!(matches!(pipeline.closed().await, Error::Protocol(_)));

        let after = pipeline.submit::<Frame>(Request::new("PING")).await;
        assert!(matches!(after, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_read_failure_fails_every_pending_command() {
        let mut expected = Vec::new();
        for _ in 0..3 {
            expected.extend(request_bytes(&Request::new("PING")));
        }
        let transport = tokio_test::io::Builder::new()
            .write(&expected)
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let pipeline = Pipeline::new(transport, PipelineConfig::default());

        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(pipeline.submit::<Frame>(Request::new("PING")).await.unwrap());
        }

        for reply in replies {
            match reply.await {
                Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
                other => panic!("Expected io error, got {other:?}"),
            }
        }
        assert!(matches!(pipeline.closed().await, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_peer_close_with_pending_commands() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let first = pipeline.submit::<Frame>(Request::new("PING")).await.unwrap();
        let second = pipeline.submit::<Frame>(Request::new("PING")).await.unwrap();
        expect_request(&mut server, &Request::new("PING")).await;
        server.write_all(b"+PONG\r\n").await.unwrap();
        drop(server);

        assert_eq!(first.await.unwrap(), Frame::simple("PONG"));
        assert!(matches!(second.await, Err(Error::Closed)));
        assert!(pipeline.is_closed());
    }

    #[tokio::test]
    async fn test_abort_is_fatal() {
        let (client, _server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());

        let reply = pipeline.submit::<Frame>(Request::new("BLPOP").arg("q").arg("0")).await.unwrap();
        pipeline.abort(Error::Timeout);

        assert!(matches!(reply.await, Err(Error::Timeout)));
        assert!(matches!(pipeline.closed().await, Error::Timeout));
        assert!(matches!(pipeline.fault(), Some(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected_up_front() {
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());
        spawn_server(server, echo);

        let empty = pipeline.submit::<Frame>(Request::default()).await;
        assert!(matches!(empty, Err(Error::EmptyRequest)));

        // Nothing went out, so the next reply still lines up.
        let reply = pipeline.call::<String>(Request::new("ECHO").arg("x")).await.unwrap();
        assert_eq!(reply, "x");
    }

    #[tokio::test]
    async fn test_abandoned_reply_keeps_order() {
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());
        spawn_server(server, echo);

        let abandoned = pipeline.submit::<String>(Request::new("ECHO").arg("first")).await.unwrap();
        drop(abandoned);
        let kept = pipeline.submit::<String>(Request::new("ECHO").arg("second")).await.unwrap();

        assert_eq!(kept.await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_drains_after_handles_dropped() {
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(client, PipelineConfig::default());
        let watcher = pipeline.closed.clone();
        spawn_server(server, echo);

        let reply = pipeline.submit::<String>(Request::new("ECHO").arg("late")).await.unwrap();
        drop(pipeline);

        assert_eq!(reply.await.unwrap(), "late");
        let mut watcher = watcher;
        let fault = watcher.wait_for(Option::is_some).await.unwrap().clone();
        assert!(matches!(fault, Some(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_over_small_transport() {
        // Tiny transport buffer: writes and reads must interleave.
        let (client, server) = tokio::io::duplex(64);
        let config = PipelineConfig {
            max_batch: 8,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(client, config);
        spawn_server(server, echo);

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let value = format!("{worker}-{i}-{}", "x".repeat(100));
                    let reply = pipeline
                        .call::<String>(Request::new("ECHO").arg(&value))
                        .await
                        .unwrap();
                    assert_eq!(reply, value);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_outbound_limit_still_sends() {
        let (client, server) = tokio::io::duplex(4096);
        let config = PipelineConfig {
            max_outbound_buffer: 0,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(client, config);
        spawn_server(server, echo);

        let call = async {
            for i in 0..3 {
                let value = i.to_string();
                let reply = pipeline.call::<String>(Request::new("ECHO").arg(&value)).await;
                assert_eq!(reply.unwrap(), value);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("pipeline stalled with a zero outbound limit");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_outbound_backpressure_keeps_order() {
        // A request is 29 bytes: one of them is over the outbound limit and
        // two fill most of the transport.
        let (client, server) = tokio::io::duplex(64);
        let config = PipelineConfig {
            channel_capacity: 1,
            max_batch: 1,
            max_outbound_buffer: 16,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(client, config);
        let submitted = Arc::new(AtomicUsize::new(0));

        let producer = {
            let pipeline = pipeline.clone();
            let submitted = submitted.clone();
            tokio::spawn(async move {
                let mut replies = Vec::new();
                for i in 0..200 {
                    let request = Request::new("ECHO").arg(format!("value-{i:03}"));
                    replies.push(pipeline.submit::<String>(request).await.unwrap());
                    submitted.fetch_add(1, Ordering::SeqCst);
                }
                replies
            })
        };

        // Nobody reads the transport yet, so submits must stall.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        let stalled_at = submitted.load(Ordering::SeqCst);
        assert!(stalled_at < 10, "{stalled_at} submits got through");

        spawn_server(server, echo);
        let replies = producer.await.unwrap();
        assert_eq!(replies.len(), 200);
        for (i, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply.await.unwrap(), format!("value-{i:03}"));
        }
    }

    /// Transport whose flush never completes.
    struct StalledFlush(DuplexStream);

    impl AsyncRead for StalledFlush {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StalledFlush {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_pending_flush_does_not_block_replies() {
        let (client, server) = tokio::io::duplex(4096);
        let pipeline = Pipeline::new(StalledFlush(client), PipelineConfig::default());
        spawn_server(server, echo);

        let calls = async {
            assert_eq!(pipeline.call::<String>(Request::new("PING")).await.unwrap(), "PONG");
            let first = pipeline.submit::<String>(Request::new("ECHO").arg("a")).await.unwrap();
            let second = pipeline.submit::<String>(Request::new("ECHO").arg("b")).await.unwrap();
            assert_eq!(first.await.unwrap(), "a");
            assert_eq!(second.await.unwrap(), "b");
        };
        tokio::time::timeout(Duration::from_secs(5), calls)
            .await
            .expect("replies blocked behind a pending flush");
        assert!(!pipeline.is_closed());
    }
}
