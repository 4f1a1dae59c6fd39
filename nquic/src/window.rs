//! Accounting for windowed sends
//!
//! With send buffering disabled the engine keeps only what it is currently sending, so the
//! binding queues chunks itself and releases them as the engine reports room. This module holds
//! the queue and the window rule; [`crate::stream`] performs the actual submissions.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{error::Error, flags::SendFlags};

/// Window used until the engine reports an ideal send buffer size
pub const DEFAULT_BOOTSTRAP_WINDOW: u64 = 64 * 1024;

/// How many windows' worth of data [`Stream::enqueue`](crate::Stream::enqueue) may hold back
const QUEUE_WINDOWS: u64 = 4;

/// Per-call options for windowed sends
#[derive(Debug, Copy, Clone, Default)]
pub struct SendWindowOptions {
    /// Overrides the configuration's bootstrap window for this operation
    pub bootstrap_window: Option<u64>,
}

/// One windowed-send operation
///
/// Created by `send_chunks` or the first `enqueue`, and finished once it is draining with an empty
/// queue and nothing in flight.
#[derive(Debug)]
pub(crate) struct WindowedSend {
    /// Distinguishes completions of this operation's chunks from those of earlier operations
    pub(crate) generation: u64,
    queue: VecDeque<Bytes>,
    queued_bytes: u64,
    in_flight_bytes: u64,
    in_flight_chunks: u64,
    bootstrap: u64,
    /// Attached to the last chunk once `closed`
    final_flags: SendFlags,
    /// Whether chunks are being released to the engine
    draining: bool,
    /// Whether the queue accepts more chunks
    closed: bool,
    failed: bool,
    waiter: Option<oneshot::Sender<Result<(), Error>>>,
}

impl WindowedSend {
    pub(crate) fn new(generation: u64, bootstrap: u64) -> Self {
        Self {
            generation,
            queue: VecDeque::new(),
            queued_bytes: 0,
            in_flight_bytes: 0,
            in_flight_chunks: 0,
            bootstrap,
            final_flags: SendFlags::NONE,
            draining: false,
            closed: false,
            failed: false,
            waiter: None,
        }
    }

    /// An operation over a fixed batch, draining immediately
    ///
    /// A batch with no chunks but with `final_flags` gets one empty chunk to carry them.
    pub(crate) fn batch(
        generation: u64,
        bootstrap: u64,
        chunks: impl IntoIterator<Item = Bytes>,
        final_flags: SendFlags,
        waiter: oneshot::Sender<Result<(), Error>>,
    ) -> Self {
        let mut op = Self::new(generation, bootstrap);
        for chunk in chunks {
            op.queued_bytes += chunk.len() as u64;
            op.queue.push_back(chunk);
        }
        op.start_draining(final_flags, waiter, true);
        op
    }

    fn window(&self, ideal: u64) -> u64 {
        ideal.max(self.bootstrap)
    }

    /// Append a chunk ahead of a later drain
    pub(crate) fn enqueue(&mut self, data: Bytes, ideal: u64) -> Result<(), Error> {
        if self.closed || self.failed {
            return Err(Error::InvalidState);
        }
        let limit = self.window(ideal).saturating_mul(QUEUE_WINDOWS);
        let len = data.len() as u64;
        if self.queued_bytes.saturating_add(len) > limit {
            return Err(Error::InvalidParameter);
        }
        self.queued_bytes += len;
        self.queue.push_back(data);
        Ok(())
    }

    /// Start releasing queued chunks, resolving `waiter` once everything has been sent
    ///
    /// Non-empty `final_flags` close the queue and ride on its last chunk.
    pub(crate) fn drain(
        &mut self,
        final_flags: SendFlags,
        waiter: oneshot::Sender<Result<(), Error>>,
    ) -> Result<(), Error> {
        if self.waiter.is_some() || self.closed || self.failed {
            return Err(Error::InvalidState);
        }
        self.start_draining(final_flags, waiter, !final_flags.is_empty());
        Ok(())
    }

    fn start_draining(
        &mut self,
        final_flags: SendFlags,
        waiter: oneshot::Sender<Result<(), Error>>,
        close: bool,
    ) {
        if close && self.queue.is_empty() && !final_flags.is_empty() {
            self.queue.push_back(Bytes::new());
        }
        self.final_flags = final_flags;
        self.closed = close;
        self.draining = true;
        self.waiter = Some(waiter);
    }

    /// Take the next chunk the window admits, counting it as in flight
    ///
    /// A chunk is admitted when nothing is in flight, so a single chunk larger than the window
    /// still goes out on its own.
    pub(crate) fn next_chunk(&mut self, ideal: u64) -> Option<(Bytes, SendFlags)> {
        if !self.draining || self.failed {
            return None;
        }
        let len = self.queue.front()?.len() as u64;
        let window = self.window(ideal);
        if self.in_flight_chunks > 0 && self.in_flight_bytes.saturating_add(len) > window {
            return None;
        }
        let data = self.queue.pop_front()?;
        self.queued_bytes = self.queued_bytes.saturating_sub(len);
        self.in_flight_bytes += len;
        self.in_flight_chunks += 1;
        let flags = match self.closed && self.queue.is_empty() {
            true => self.final_flags,
            false => SendFlags::NONE,
        };
        Some((data, flags))
    }

    /// Account for a chunk the engine is done with
    pub(crate) fn chunk_done(&mut self, len: u64) {
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(len);
        self.in_flight_chunks = self.in_flight_chunks.saturating_sub(1);
    }

    /// Resolve the caller with `error` and drop everything not yet submitted
    pub(crate) fn fail(&mut self, error: Error) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(error));
        }
        self.failed = true;
        self.queue.clear();
        self.queued_bytes = 0;
    }

    /// Whether the operation has nothing left to do
    pub(crate) fn is_finished(&self) -> bool {
        (self.failed || (self.draining && self.queue.is_empty())) && self.in_flight_chunks == 0
    }

    /// Resolve the caller, if it has not been resolved already
    pub(crate) fn finish(mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> (u64, u64) {
        (self.in_flight_chunks, self.in_flight_bytes)
    }
}
