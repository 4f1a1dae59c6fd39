use std::{
    ffi::c_void,
    fmt, mem,
    ptr,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    api::{api, buffer_len, Api},
    connection::ConnectionInner,
    error::Error,
    event::StreamEvent,
    ffi::{param, Handle, QuicBuffer, RawStatus, RawStreamEvent},
    flags::{ReceiveFlags, SendFlags, StreamOpenFlags, StreamShutdownFlags, StreamStartFlags},
    mutex::Mutex,
    object::{guard_callback, recover, NativeObject, ObjectBase},
    recv::{self, Receive, ReceiveSender},
    status::Status,
    window::{SendWindowOptions, WindowedSend},
};

/// Lifecycle of a [`Stream`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Opened but not started
    Idle,
    Starting,
    Open,
    ShuttingDown,
    /// Terminal
    Closed,
}

/// A QUIC stream
///
/// Locally opened streams come from [`Connection::open_stream`](crate::Connection::open_stream)
/// and must be [`start`](Self::start)ed; streams opened by the peer are handed to the
/// connection's peer-stream handler already open.
///
/// Cloning is cheap and refers to the same stream. The native stream is closed once the last
/// clone is dropped and the engine has finished with it.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn open(
        connection: &Arc<ConnectionInner>,
        flags: StreamOpenFlags,
    ) -> Result<Self, Error> {
        let api = api()?;
        let inner = StreamInner::new(connection, StreamState::Idle);
        let handle = api.stream_open(
            connection.base().handle(),
            flags.bits(),
            stream_callback,
            inner.context(),
        )?;
        inner.base.set_handle(handle);
        trace!(?handle, ?flags, "stream opened");
        Ok(Self { inner })
    }

    /// Wrap a stream the peer opened, taking over its handle
    pub(crate) fn adopt(api: Api, connection: &Arc<ConnectionInner>, handle: Handle) -> Self {
        let inner = StreamInner::new(connection, StreamState::Open);
        inner.base.set_handle(handle);
        api.set_stream_callback(handle, stream_callback, inner.context());
        inner.retain_self_for_callback();
        Self { inner }
    }

    /// Start the stream, completing once the engine reports it open
    ///
    /// Fails with [`Error::InvalidState`] unless the stream is idle.
    pub async fn start(&self, flags: StreamStartFlags) -> Result<(), Error> {
        let rx = self.inner.begin_start(flags)?;
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Send `data`, completing when the engine is done with it
    ///
    /// Only valid on an open stream with no windowed send in progress. Sends are submitted to the
    /// engine in the order they are first polled. Fails with [`Error::Aborted`] if the engine
    /// cancels the send.
    pub async fn send(&self, data: impl Into<Bytes>, flags: SendFlags) -> Result<(), Error> {
        let rx = self.inner.begin_send(data.into(), flags)?;
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Send `chunks` in order, releasing them to the engine as its send window allows
    ///
    /// Requires a connection configured with send buffering disabled. At most
    /// `max(ideal send buffer size, bootstrap window)` bytes are in flight at once, except that a
    /// single chunk larger than the window is sent on its own. `final_flags` are attached to the
    /// last chunk only; with no chunks they are sent on an empty one.
    pub async fn send_chunks<I>(
        &self,
        chunks: I,
        final_flags: SendFlags,
        options: SendWindowOptions,
    ) -> Result<(), Error>
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let chunks = chunks.into_iter().map(Into::into).collect::<Vec<Bytes>>();
        let rx = match self.inner.begin_send_chunks(chunks, final_flags, options)? {
            Some(rx) => rx,
            None => return Ok(()),
        };
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Queue `data` for a later [`drain`](Self::drain)
    ///
    /// The queue holds at most four windows of data; beyond that this fails with
    /// [`Error::InvalidParameter`]. Fails with [`Error::InvalidState`] once a drain has finished
    /// the stream.
    pub fn enqueue(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.inner.enqueue(data.into())
    }

    /// Release everything queued with [`enqueue`](Self::enqueue), completing once all of it has
    /// been sent
    ///
    /// Non-empty `final_flags` close the queue and ride on its last chunk, or on an empty chunk
    /// if nothing is queued.
    pub async fn drain(&self, final_flags: SendFlags) -> Result<(), Error> {
        let rx = match self.inner.begin_drain(final_flags)? {
            Some(rx) => rx,
            None => return Ok(()),
        };
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Shut the stream down, completing when the engine reports it closed
    ///
    /// Does nothing if the stream is already shutting down or closed. Fails with
    /// [`Error::InvalidState`] on a stream that was never started.
    pub async fn shutdown(&self, flags: StreamShutdownFlags, error_code: u64) -> Result<(), Error> {
        if let Some(rx) = self.inner.begin_shutdown(flags, error_code)? {
            // Completion carries no error; a dropped waiter also means the stream is gone
            let _ = rx.await;
        }
        Ok(())
    }

    /// Set the send priority; higher values are sent first
    pub fn set_priority(&self, priority: u16) -> Result<(), Error> {
        api()?.set_param_value(self.inner.base.handle(), param::STREAM_PRIORITY, &priority)
    }

    pub fn priority(&self) -> Result<u16, Error> {
        api()?.get_param_value(self.inner.base.handle(), param::STREAM_PRIORITY)
    }

    /// The data the peer sends on this stream
    ///
    /// Can be taken once; later calls fail with [`Error::InvalidState`].
    pub fn receive(&self) -> Result<Receive, Error> {
        self.inner
            .state
            .lock("receive")
            .receive
            .take()
            .ok_or(Error::InvalidState)
    }

    /// The stream's id, once the engine has assigned one
    pub fn id(&self) -> Result<u64, Error> {
        if let Some(id) = self.inner.state.lock("id").id {
            return Ok(id);
        }
        let id = api()?.get_param_value::<u64>(self.inner.base.handle(), param::STREAM_ID)?;
        self.inner.state.lock("id").id = Some(id);
        Ok(id)
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.lock("state").state
    }

    /// The send buffer size the engine last reported as ideal, 0 if none yet
    pub fn ideal_send_buffer_size(&self) -> u64 {
        self.inner.state.lock("ideal_send_buffer_size").ideal_send_buffer_size
    }

    /// Whether the native stream is still open; it is closed once the last handle is dropped
    pub fn is_valid(&self) -> bool {
        self.inner.base.is_valid()
    }

    pub(crate) fn inner(&self) -> &Arc<StreamInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> Handle {
        self.inner.base.handle()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock("fmt");
        f.debug_struct("Stream")
            .field("handle", &self.inner.base.handle())
            .field("id", &state.id)
            .field("state", &state.state)
            .finish()
    }
}

pub(crate) struct StreamInner {
    base: ObjectBase<Self>,
    connection: Weak<ConnectionInner>,
    state: Mutex<State>,
}

impl NativeObject for StreamInner {
    fn base(&self) -> &ObjectBase<Self> {
        &self.base
    }
}

struct State {
    state: StreamState,
    id: Option<u64>,
    start: Option<oneshot::Sender<Result<(), Error>>>,
    shutdown: Option<oneshot::Sender<()>>,
    /// Waiters of ordinary sends, by token
    sends: FxHashMap<u64, oneshot::Sender<Result<(), Error>>>,
    next_send_token: u64,
    window: Option<WindowedSend>,
    generation: u64,
    /// Whether some thread is submitting windowed chunks
    pumping: bool,
    ideal_send_buffer_size: u64,
    /// Set once terminal flags have been submitted or queued
    send_finished: bool,
    receiver: ReceiveSender,
    receive: Option<Receive>,
}

impl State {
    fn check_sendable(&self) -> Result<(), Error> {
        match self.state == StreamState::Open && !self.send_finished {
            true => Ok(()),
            false => Err(Error::InvalidState),
        }
    }

    /// Remove the windowed operation if it has nothing left to do
    fn take_finished_window(&mut self) -> Option<WindowedSend> {
        self.window.take_if(|op| op.is_finished())
    }
}

impl StreamInner {
    fn new(connection: &Arc<ConnectionInner>, state: StreamState) -> Arc<Self> {
        let (receiver, receive) = recv::channel();
        Arc::new(Self {
            base: ObjectBase::new(),
            connection: Arc::downgrade(connection),
            state: Mutex::new(State {
                state,
                id: None,
                start: None,
                shutdown: None,
                sends: FxHashMap::default(),
                next_send_token: 0,
                window: None,
                generation: 0,
                pumping: false,
                ideal_send_buffer_size: 0,
                send_finished: false,
                receiver,
                receive: Some(receive),
            }),
        })
    }

    fn begin_start(
        self: &Arc<Self>,
        flags: StreamStartFlags,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let api = api()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock("start");
            if state.state != StreamState::Idle {
                return Err(Error::InvalidState);
            }
            state.state = StreamState::Starting;
            state.start = Some(tx);
        }

        self.retain_self_for_callback();
        if let Err(e) = api.stream_start(self.base.handle(), flags.bits()) {
            debug!(handle = ?self.base.handle(), error = %e, "stream start failed");
            {
                let mut state = self.state.lock("start failed");
                state.state = StreamState::Closed;
                state.start = None;
                state.receiver.finish(Err(e));
            }
            self.release_self_from_callback();
            return Err(e);
        }
        Ok(rx)
    }

    fn begin_send(
        &self,
        data: Bytes,
        flags: SendFlags,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let api = api()?;
        let mut ctx = SendContext::new(SendKind::Send { token: 0 }, data)?;
        let (tx, rx) = oneshot::channel();
        let token = {
            let mut state = self.state.lock("send");
            state.check_sendable()?;
            if state.window.is_some() {
                return Err(Error::InvalidState);
            }
            let token = state.next_send_token;
            state.next_send_token += 1;
            state.sends.insert(token, tx);
            if flags.is_terminal() {
                state.send_finished = true;
            }
            token
        };
        ctx.kind = SendKind::Send { token };

        if let Err(e) = submit(api, self.base.handle(), ctx, flags) {
            let mut state = self.state.lock("send failed");
            state.sends.remove(&token);
            if flags.is_terminal() {
                state.send_finished = false;
            }
            return Err(e);
        }
        Ok(rx)
    }

    fn begin_send_chunks(
        &self,
        chunks: Vec<Bytes>,
        final_flags: SendFlags,
        options: SendWindowOptions,
    ) -> Result<Option<oneshot::Receiver<Result<(), Error>>>, Error> {
        for chunk in &chunks {
            buffer_len(chunk.len())?;
        }
        let bootstrap = self.windowed_send_bootstrap()?;
        let bootstrap = options.bootstrap_window.unwrap_or(bootstrap);

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock("send_chunks");
            state.check_sendable()?;
            if state.window.is_some() || !state.sends.is_empty() {
                return Err(Error::InvalidState);
            }
            if chunks.is_empty() && final_flags.is_empty() {
                return Ok(None);
            }
            state.generation += 1;
            let generation = state.generation;
            trace!(generation, chunks = chunks.len(), ?final_flags, "windowed send");
            state.window = Some(WindowedSend::batch(
                generation,
                bootstrap,
                chunks,
                final_flags,
                tx,
            ));
            if final_flags.is_terminal() {
                state.send_finished = true;
            }
        }
        self.pump();
        Ok(Some(rx))
    }

    fn enqueue(&self, data: Bytes) -> Result<(), Error> {
        buffer_len(data.len())?;
        let bootstrap = self.windowed_send_bootstrap()?;
        {
            let mut state = self.state.lock("enqueue");
            state.check_sendable()?;
            if !state.sends.is_empty() {
                return Err(Error::InvalidState);
            }
            let ideal = state.ideal_send_buffer_size;
            match state.window.as_mut() {
                Some(op) => op.enqueue(data, ideal)?,
                None => {
                    let mut op = WindowedSend::new(state.generation + 1, bootstrap);
                    op.enqueue(data, ideal)?;
                    state.generation += 1;
                    state.window = Some(op);
                }
            }
        }
        // Picked up right away if a drain is already running
        self.pump();
        Ok(())
    }

    fn begin_drain(
        &self,
        final_flags: SendFlags,
    ) -> Result<Option<oneshot::Receiver<Result<(), Error>>>, Error> {
        let bootstrap = self.windowed_send_bootstrap()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock("drain");
            state.check_sendable()?;
            if !state.sends.is_empty() {
                return Err(Error::InvalidState);
            }
            if state.window.is_none() {
                if final_flags.is_empty() {
                    return Ok(None);
                }
                state.generation += 1;
                state.window = Some(WindowedSend::new(state.generation, bootstrap));
            }
            if let Some(op) = state.window.as_mut() {
                op.drain(final_flags, tx)?;
            }
            if final_flags.is_terminal() {
                state.send_finished = true;
            }
        }
        self.pump();
        Ok(Some(rx))
    }

    fn begin_shutdown(
        &self,
        flags: StreamShutdownFlags,
        error_code: u64,
    ) -> Result<Option<oneshot::Receiver<()>>, Error> {
        let api = api()?;
        let (tx, rx) = oneshot::channel();
        let previous = {
            let mut state = self.state.lock("shutdown");
            let previous = state.state;
            match previous {
                StreamState::Idle => return Err(Error::InvalidState),
                StreamState::ShuttingDown | StreamState::Closed => return Ok(None),
                StreamState::Starting | StreamState::Open => {}
            }
            state.state = StreamState::ShuttingDown;
            state.shutdown = Some(tx);
            previous
        };

        if let Err(e) = api.stream_shutdown(self.base.handle(), flags.bits(), error_code) {
            let mut state = self.state.lock("shutdown failed");
            if state.state == StreamState::ShuttingDown {
                state.state = previous;
            }
            state.shutdown = None;
            return Err(e);
        }
        Ok(Some(rx))
    }

    fn windowed_send_bootstrap(&self) -> Result<u64, Error> {
        self.connection
            .upgrade()
            .ok_or(Error::InvalidState)?
            .windowed_send_bootstrap()
    }

    /// Submit windowed chunks while the window admits them
    ///
    /// Only one thread pumps at a time, so chunks reach the engine in queue order. Others that
    /// find a pump running return at once; the running pump re-reads the state on every
    /// iteration and sees their changes.
    fn pump(&self) {
        let Ok(api) = api() else { return };
        let mut claimed = false;
        loop {
            let (generation, data, flags) = {
                let mut state = self.state.lock("pump");
                if !claimed {
                    if state.pumping {
                        return;
                    }
                    state.pumping = true;
                    claimed = true;
                }
                let ideal = state.ideal_send_buffer_size;
                let next = state.window.as_mut().and_then(|op| {
                    let generation = op.generation;
                    op.next_chunk(ideal)
                        .map(|(data, flags)| (generation, data, flags))
                });
                match next {
                    Some(next) => next,
                    None => {
                        state.pumping = false;
                        let finished = state.take_finished_window();
                        drop(state);
                        if let Some(op) = finished {
                            trace!(generation = op.generation, "windowed send complete");
                            op.finish();
                        }
                        return;
                    }
                }
            };

            let len = data.len() as u64;
            let result = SendContext::new(SendKind::Chunk { generation }, data)
                .and_then(|ctx| submit(api, self.base.handle(), ctx, flags));
            if let Err(e) = result {
                debug!(generation, error = %e, "windowed chunk submission failed");
                let mut state = self.state.lock("pump failed");
                if let Some(op) = state.window.as_mut().filter(|op| op.generation == generation) {
                    op.chunk_done(len);
                    op.fail(e);
                }
            }
        }
    }

    fn handle_event(&self, handle: Handle, event: StreamEvent) -> Status {
        match event {
            StreamEvent::StartComplete {
                status,
                id,
                peer_accepted,
            } => {
                trace!(?handle, id, %status, peer_accepted, "stream start complete");
                let mut state = self.state.lock("start complete");
                let waiter = state.start.take();
                match status.to_result() {
                    Ok(()) => {
                        state.id = Some(id);
                        let result = match state.state {
                            StreamState::Starting => {
                                state.state = StreamState::Open;
                                Ok(())
                            }
                            _ => Err(Error::Aborted),
                        };
                        drop(state);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(result);
                        }
                    }
                    Err(e) => {
                        state.state = StreamState::Closed;
                        state.receiver.finish(Err(e));
                        drop(state);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Err(e));
                        }
                        self.release_self_from_callback();
                    }
                }
            }
            StreamEvent::Receive { data, total, flags } => {
                {
                    let mut state = self.state.lock("receive");
                    if !data.is_empty() {
                        state.receiver.push(data);
                    }
                    if flags.contains(ReceiveFlags::FIN) {
                        state.receiver.finish(Ok(()));
                    }
                }
                // The engine's buffers are only valid until acknowledged; ours is a copy
                if let Ok(api) = api() {
                    api.stream_receive_complete(handle, total);
                }
                return Status::PENDING;
            }
            StreamEvent::SendComplete { canceled, context } => {
                if context.0.is_null() {
                    return Status::SUCCESS;
                }
                let ctx = unsafe { SendContext::<SendKind>::from_raw(context.0) };
                self.send_complete(&ctx, canceled);
            }
            StreamEvent::PeerSendShutdown => {
                trace!(?handle, "peer finished sending");
                self.state.lock("peer send shutdown").receiver.finish(Ok(()));
            }
            StreamEvent::PeerSendAborted { error_code } => {
                debug!(?handle, error_code, "peer aborted sending");
                self.state
                    .lock("peer send aborted")
                    .receiver
                    .finish(Err(Error::Aborted));
            }
            StreamEvent::PeerReceiveAborted { error_code } => {
                debug!(?handle, error_code, "peer aborted receiving");
            }
            StreamEvent::SendShutdownComplete { graceful } => {
                trace!(?handle, graceful, "send shutdown complete");
            }
            StreamEvent::IdealSendBufferSize { byte_count } => {
                trace!(?handle, byte_count, "ideal send buffer size");
                let windowed = {
                    let mut state = self.state.lock("ideal send buffer size");
                    state.ideal_send_buffer_size = byte_count;
                    state.window.is_some()
                };
                if windowed {
                    self.pump();
                }
            }
            StreamEvent::PeerAccepted => trace!(?handle, "peer accepted stream"),
            StreamEvent::ShutdownComplete {
                connection_shutdown,
                connection_error_code,
                connection_close_status,
            } => {
                trace!(
                    ?handle,
                    connection_shutdown,
                    connection_error_code,
                    %connection_close_status,
                    "stream shutdown complete"
                );
                self.terminate();
            }
            StreamEvent::Unknown(kind) => trace!(?handle, kind, "unknown stream event"),
        }
        Status::SUCCESS
    }

    fn send_complete(&self, ctx: &SendContext<SendKind>, canceled: bool) {
        let result = match canceled {
            true => Err(Error::Aborted),
            false => Ok(()),
        };
        match ctx.kind {
            SendKind::Send { token } => {
                let waiter = self.state.lock("send complete").sends.remove(&token);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(result);
                }
            }
            SendKind::Chunk { generation } => {
                {
                    let mut state = self.state.lock("chunk complete");
                    match state.window.as_mut() {
                        Some(op) if op.generation == generation => {
                            op.chunk_done(ctx.len());
                            if canceled {
                                op.fail(Error::Aborted);
                            }
                        }
                        _ => {
                            trace!(generation, "completion for a finished windowed send");
                            return;
                        }
                    }
                }
                self.pump();
            }
        }
    }

    /// Resolve every pending waiter with [`Error::Aborted`]
    ///
    /// Leaves the lifecycle state alone; used when the connection goes away underneath the
    /// stream.
    pub(crate) fn abort_waiters(&self) {
        let (start, sends, window) = {
            let mut state = self.state.lock("abort waiters");
            state.receiver.finish(Err(Error::Aborted));
            (
                state.start.take(),
                mem::take(&mut state.sends),
                state.window.take(),
            )
        };
        if let Some(waiter) = start {
            let _ = waiter.send(Err(Error::Aborted));
        }
        for (_, waiter) in sends {
            let _ = waiter.send(Err(Error::Aborted));
        }
        if let Some(mut op) = window {
            op.fail(Error::Aborted);
        }
    }

    fn terminate(&self) {
        let shutdown = {
            let mut state = self.state.lock("shutdown complete");
            state.state = StreamState::Closed;
            state.shutdown.take()
        };
        if let Some(waiter) = shutdown {
            let _ = waiter.send(());
        }
        self.abort_waiters();
        self.release_self_from_callback();
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(handle) = self.base.take_handle() {
            if let Ok(api) = api() {
                // Detach first so nothing reaches a freed context
                api.set_stream_callback(handle, stream_callback, ptr::null());
                api.stream_close(handle);
            }
        }
    }
}

pub(crate) unsafe extern "C" fn stream_callback(
    handle: Handle,
    ctx: *mut c_void,
    event: *mut RawStreamEvent,
) -> RawStatus {
    guard_callback("stream", || {
        let Some(stream) = (unsafe { recover::<StreamInner>(ctx) }) else {
            return Status::SUCCESS;
        };
        let event = unsafe { StreamEvent::from_raw(&*event) };
        stream.handle_event(handle, event)
    })
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum SendKind {
    Send { token: u64 },
    Chunk { generation: u64 },
}

/// A payload handed to the engine, with the descriptor pointing into it
///
/// Owned by the engine between submission and completion.
pub(crate) struct SendContext<K> {
    pub(crate) kind: K,
    buffer: QuicBuffer,
    data: Bytes,
}

impl<K> SendContext<K> {
    pub(crate) fn new(kind: K, data: Bytes) -> Result<Box<Self>, Error> {
        let buffer = QuicBuffer {
            length: buffer_len(data.len())?,
            // The engine only reads through the descriptor
            buffer: data.as_ptr() as *mut u8,
        };
        Ok(Box::new(Self { kind, buffer, data }))
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Give up ownership, returning the descriptor and the context pointer for the engine
    pub(crate) fn into_raw(self: Box<Self>) -> (*const QuicBuffer, *mut c_void) {
        let raw = Box::into_raw(self);
        (unsafe { ptr::addr_of!((*raw).buffer) }, raw.cast())
    }

    /// Reclaim a context the engine is done with
    ///
    /// # Safety
    ///
    /// `ctx` must come from [`into_raw`](Self::into_raw) on a `SendContext<K>` and not have been
    /// reclaimed before.
    pub(crate) unsafe fn from_raw(ctx: *mut c_void) -> Box<Self> {
        unsafe { Box::from_raw(ctx.cast()) }
    }
}

/// Hand one send context to the engine, reclaiming it if the submission fails
fn submit(
    api: Api,
    handle: Handle,
    ctx: Box<SendContext<SendKind>>,
    flags: SendFlags,
) -> Result<(), Error> {
    let (buffer, ctx) = ctx.into_raw();
    let result = unsafe { api.stream_send(handle, buffer, flags.bits(), ctx) };
    if result.is_err() {
        drop(unsafe { SendContext::<SendKind>::from_raw(ctx) });
    }
    result
}
