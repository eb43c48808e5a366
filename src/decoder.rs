//! Reply decoder.
//!
//! Owns the accumulation buffer for one connection. Bytes from the
//! transport are appended as they arrive; complete frames are cut off the
//! front one at a time and each one resolves the head of the pending
//! queue. An incomplete frame leaves the buffer untouched so the next
//! delivery resumes from the same point. The scanner reports how many
//! bytes the frame needs at least, and nothing is scanned again until
//! that many have arrived. A complete frame is frozen out of the buffer
//! and bulk payloads are slices of it.
//!
//! A framing fault poisons the decoder: the read position inside the
//! stream can no longer be trusted, so every later call reports the same
//! fault instead of guessing where the next frame starts.

use bytes::BytesMut;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{build, scan, Frame, ParseLimits, Scan};
use crate::queue::PendingQueue;

/// Default initial capacity of the accumulation buffer.
pub const DEFAULT_READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// Incremental frame extractor for one connection.
#[derive(Debug)]
pub struct Decoder {
    /// Received bytes not yet part of a consumed frame.
    buffer: BytesMut,
    limits: ParseLimits,
    /// Buffer length below which the front frame cannot be complete.
    needed: usize,
    /// Set once a framing fault has been seen.
    fault: Option<Error>,
}

impl Decoder {
    /// Create a decoder with default capacity and limits.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER_CAPACITY, ParseLimits::default())
    }

    pub fn with_capacity(capacity: usize, limits: ParseLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            limits,
            needed: 0,
            fault: None,
        }
    }

    /// The accumulation buffer, for transports that read straight into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cut the next complete frame off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed
    /// in that case.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        if self.buffer.len() < self.needed {
            return Ok(None);
        }

        match scan(&self.buffer, &self.limits) {
            Scan::Complete(len) => {
                self.needed = 0;
                let frame = self.buffer.split_to(len).freeze();
                build(&frame).map(Some).map_err(|message| self.poison(message))
            }
            Scan::Incomplete(needed) => {
                self.needed = needed;
                Ok(None)
            }
            Scan::Error(message) => Err(self.poison(message)),
        }
    }

    fn poison(&mut self, message: String) -> Error {
        let fault = Error::Protocol(message);
        self.fault = Some(fault.clone());
        fault
    }

    /// Resolve pending commands from every complete frame in the buffer.
    ///
    /// Returns how many commands were resolved. On a framing fault the
    /// oldest pending command is failed with it and the fault is returned;
    /// the caller must tear the connection down. A frame arriving with no
    /// pending command is a desynchronized stream and is fatal too.
    pub fn decode(&mut self, queue: &mut PendingQueue) -> Result<usize> {
        let mut resolved = 0;

        loop {
            let frame = match self.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(resolved),
                Err(fault) => {
                    if let Some(command) = queue.pop() {
                        command.fail(fault.clone());
                    }
                    return Err(fault);
                }
            };

            let Some(command) = queue.pop() else {
                let fault = Error::Protocol(format!(
                    "unsolicited {} reply with no pending command",
                    frame.kind()
                ));
                self.fault = Some(fault.clone());
                return Err(fault);
            };

            trace!(kind = frame.kind(), pending = queue.len(), "Reply matched");
            command.resolve(frame);
            resolved += 1;
        }
    }

    /// Number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a framing fault has been seen.
    pub fn is_poisoned(&self) -> bool {
        self.fault.is_some()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
