use std::{
    ffi::{c_void, CString},
    fmt,
    future::{poll_fn, Future},
    mem,
    net::SocketAddr,
    pin::Pin,
    ptr,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    api::{api, Api},
    configuration::Configuration,
    error::Error,
    event::{ClientContext, ConnectionEvent, DatagramSendState},
    ffi::{param, Handle, RawAddr, RawConnectionEvent, RawStatus, ADDRESS_FAMILY_UNSPEC},
    flags::{ConnectionShutdownFlags, ResumptionTicketFlags, SendFlags, StreamOpenFlags},
    mutex::Mutex,
    object::{guard_callback, recover, NativeObject, ObjectBase},
    registration::Registration,
    runtime::{default_runtime, Runtime},
    status::Status,
    stream::{SendContext, Stream, StreamInner},
};

/// Largest application payload [`Connection::send_resumption_ticket`] accepts
const MAX_RESUMPTION_APP_DATA: usize = 1000;

/// Lifecycle of a [`Connection`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    ShuttingDown,
    /// Terminal
    Closed,
}

/// How the engine interleaves data from concurrently sending streams
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum StreamSchedulingScheme {
    /// Send each stream's data in full before moving on
    #[default]
    Fifo,
    RoundRobin,
}

impl StreamSchedulingScheme {
    fn to_raw(self) -> u32 {
        match self {
            Self::Fifo => 0,
            Self::RoundRobin => 1,
        }
    }

    fn from_raw(raw: u32) -> Result<Self, Error> {
        match raw {
            0 => Ok(Self::Fifo),
            1 => Ok(Self::RoundRobin),
            _ => Err(Error::Unknown(raw)),
        }
    }
}

type PeerStreamHandler =
    Arc<dyn Fn(Stream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type EventHandler = Arc<dyn Fn(&ConnectionEvent) -> Result<(), Error> + Send + Sync>;
type CertificateValidator = Arc<dyn Fn(&[u8], Option<Error>) -> Result<(), Error> + Send + Sync>;

/// A QUIC connection
///
/// Client connections are created with [`Connection::new`] and [`start`](Self::start)ed; server
/// connections come from [`Incoming::accept`](crate::Incoming::accept).
///
/// May be cloned to obtain another handle to the same connection. Once every handle is dropped,
/// a client connection that is still live is shut down with error code 0. A connection accepted
/// by a [`Listener`](crate::Listener) stays up until it closes, whether or not handles remain.
#[derive(Clone)]
pub struct Connection(ConnectionRef);

impl Connection {
    /// Open a client connection, spawning peer-stream handlers on the current Tokio runtime
    ///
    /// Fails with [`Error::InvalidState`] outside a Tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) there.
    pub fn new(registration: &Registration) -> Result<Self, Error> {
        let runtime = default_runtime().ok_or(Error::InvalidState)?;
        Self::with_runtime(registration, runtime)
    }

    pub fn with_runtime(
        registration: &Registration,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, Error> {
        let api = api()?;
        let inner = ConnectionInner::new(registration, runtime, ConnectionState::Idle, false);
        let handle =
            api.connection_open(registration.handle(), connection_callback, inner.context())?;
        inner.base.set_handle(handle);
        trace!(?handle, "connection opened");
        Ok(Self(ConnectionRef::new(inner)))
    }

    /// Connect to `server_name` on `port`, completing once the handshake does
    ///
    /// Fails with [`Error::InvalidState`] unless the connection is idle. If the transport gives up
    /// while connecting, fails with the error it reported.
    pub async fn start(
        &self,
        configuration: &Configuration,
        server_name: &str,
        port: u16,
    ) -> Result<(), Error> {
        let rx = self.0.begin_start(configuration, server_name, port)?;
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Shut the connection down, completing when the engine reports it closed
    ///
    /// Does nothing on a closed connection, and closes an idle one without involving the engine.
    /// Fails with [`Error::InvalidState`] if another `shutdown` is already waiting.
    pub async fn shutdown(&self, error_code: u64) -> Result<(), Error> {
        if let Some(rx) = self.0.begin_shutdown(error_code, Waiter::Plain)? {
            let _ = rx.await;
        }
        Ok(())
    }

    /// Like [`shutdown`](Self::shutdown), giving up after `timeout`
    ///
    /// On timeout fails with [`Error::ConnectionTimeout`] and, if `force` is set, closes the native
    /// connection without waiting further. Every pending operation is then aborted.
    pub async fn shutdown_with_timeout(
        &self,
        error_code: u64,
        timeout: Duration,
        force: bool,
    ) -> Result<(), Error> {
        let Some(rx) = self.0.begin_shutdown(error_code, Waiter::Timed)? else {
            return Ok(());
        };
        if tokio::time::timeout(timeout, rx).await.is_ok() {
            return Ok(());
        }
        // Whoever takes the slot decides the outcome
        let expired = self.0.state.lock("shutdown timeout").timed_shutdown.take().is_some();
        if !expired {
            return Ok(());
        }
        debug!(handle = ?self.0.base.handle(), ?timeout, force, "shutdown timed out");
        if force {
            self.0.force_close();
        }
        Err(Error::ConnectionTimeout)
    }

    /// Open a stream; it must be [`start`](Stream::start)ed before use
    pub fn open_stream(&self, flags: StreamOpenFlags) -> Result<Stream, Error> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::InvalidState);
        }
        let stream = Stream::open(&self.0, flags)?;
        let mut state = self.0.state.lock("open_stream");
        state.streams.retain(|s| s.strong_count() > 0);
        state.streams.push(Arc::downgrade(stream.inner()));
        Ok(stream)
    }

    /// Send an unreliable datagram
    ///
    /// Completes once the engine reports the datagram sent, acknowledged or declared lost, and
    /// fails with [`Error::Aborted`] if it is canceled or the connection closes first. Only valid
    /// on a connected connection.
    pub async fn send_datagram(
        &self,
        data: impl Into<Bytes>,
        flags: SendFlags,
    ) -> Result<(), Error> {
        let rx = self.0.begin_send_datagram(data.into(), flags)?;
        rx.await.unwrap_or(Err(Error::Aborted))
    }

    /// Datagrams received from the peer
    ///
    /// Can be taken once; later calls fail with [`Error::InvalidState`].
    pub fn datagrams(&self) -> Result<Datagrams, Error> {
        self.0
            .state
            .lock("datagrams")
            .datagrams_rx
            .take()
            .ok_or(Error::InvalidState)
    }

    /// Offer a ticket from an earlier connection to resume its session
    ///
    /// Clients only, before [`start`](Self::start).
    pub fn set_resumption_ticket(&self, ticket: &[u8]) -> Result<(), Error> {
        let api = api()?;
        if ticket.is_empty() || ticket.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidParameter);
        }
        {
            let state = self.0.state.lock("set_resumption_ticket");
            if state.is_server || state.state != ConnectionState::Idle {
                return Err(Error::InvalidState);
            }
        }
        api.set_param(self.0.base.handle(), param::CONN_RESUMPTION_TICKET, ticket)
    }

    /// Send the client a resumption ticket carrying `app_data`
    ///
    /// Servers only, once connected. `app_data` is limited to 1000 bytes.
    pub fn send_resumption_ticket(
        &self,
        flags: ResumptionTicketFlags,
        app_data: &[u8],
    ) -> Result<(), Error> {
        let api = api()?;
        if app_data.len() > MAX_RESUMPTION_APP_DATA {
            return Err(Error::InvalidParameter);
        }
        {
            let state = self.0.state.lock("send_resumption_ticket");
            if !state.is_server || state.state != ConnectionState::Connected {
                return Err(Error::InvalidState);
            }
        }
        api.connection_send_resumption_ticket(self.0.base.handle(), flags.bits(), app_data)
    }

    /// The last resumption ticket the server sent, for use with
    /// [`set_resumption_ticket`](Self::set_resumption_ticket) on a later connection
    pub fn resumption_ticket(&self) -> Option<Bytes> {
        self.0.state.lock("resumption_ticket").resumption_ticket.clone()
    }

    pub fn set_stream_scheduling_scheme(
        &self,
        scheme: StreamSchedulingScheme,
    ) -> Result<(), Error> {
        api()?.set_param_value(
            self.0.base.handle(),
            param::CONN_STREAM_SCHEDULING_SCHEME,
            &scheme.to_raw(),
        )
    }

    pub fn stream_scheduling_scheme(&self) -> Result<StreamSchedulingScheme, Error> {
        let raw = api()?.get_param_value::<u32>(
            self.0.base.handle(),
            param::CONN_STREAM_SCHEDULING_SCHEME,
        )?;
        StreamSchedulingScheme::from_raw(raw)
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        self.address(param::CONN_LOCAL_ADDRESS)
    }

    pub fn remote_address(&self) -> Result<SocketAddr, Error> {
        self.address(param::CONN_REMOTE_ADDRESS)
    }

    fn address(&self, id: u32) -> Result<SocketAddr, Error> {
        let raw = api()?.get_param_value::<RawAddr>(self.0.base.handle(), id)?;
        raw.to_socket_addr().ok_or(Error::InvalidState)
    }

    pub fn state(&self) -> ConnectionState {
        self.0.state.lock("state").state
    }

    /// The application protocol agreed during the handshake
    pub fn negotiated_alpn(&self) -> Option<Bytes> {
        self.0.state.lock("negotiated_alpn").negotiated_alpn.clone()
    }

    /// Run `handler` on the connection's runtime for every stream the peer opens
    ///
    /// Without a handler, peer streams are closed as soon as they arrive.
    pub fn on_peer_stream<F, Fut>(&self, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PeerStreamHandler = Arc::new(move |stream| Box::pin(handler(stream)));
        self.0.state.lock("on_peer_stream").peer_stream_handler = Some(handler);
    }

    /// See every event before the connection acts on it
    ///
    /// Runs on an engine thread and must not block. Returning `Err` skips the connection's own
    /// handling and reports the error to the engine.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ConnectionEvent) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.0.state.lock("on_event").event_handler = Some(Arc::new(handler));
    }

    /// Decide on the peer's certificate
    ///
    /// `handler` receives the DER encoded certificate and, when validation was deferred, the
    /// engine's own verdict. `Ok` accepts the certificate and `Err` rejects it. Runs on an engine
    /// thread and must not block.
    pub fn on_peer_certificate<F>(&self, handler: F)
    where
        F: Fn(&[u8], Option<Error>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.0.state.lock("on_peer_certificate").certificate_validator = Some(Arc::new(handler));
    }

    /// Complete a certificate validation that was left pending
    pub fn certificate_validation_complete(
        &self,
        accept: bool,
        tls_alert: u16,
    ) -> Result<(), Error> {
        api()?.connection_certificate_validation_complete(self.0.base.handle(), accept, tls_alert)
    }

    /// Whether the native connection is still open
    ///
    /// Only a forced [`shutdown_with_timeout`](Self::shutdown_with_timeout) closes it while
    /// handles remain.
    pub fn is_valid(&self) -> bool {
        self.0.base.is_valid()
    }

    /// Keep an accepted connection alive until it closes
    ///
    /// Does nothing for client connections and connections that already closed.
    pub(crate) fn hand_to_engine(&self) {
        let mut state = self.0.state.lock("hand to engine");
        if !state.is_server
            || state.state == ConnectionState::Closed
            || state.engine_ref.is_some()
        {
            return;
        }
        // Counted without re-locking
        state.ref_count += 1;
        state.engine_ref = Some(ConnectionRef(self.0 .0.clone()));
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> Handle {
        self.0.base.handle()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock("fmt");
        f.debug_struct("Connection")
            .field("handle", &self.0.base.handle())
            .field("state", &state.state)
            .field("is_server", &state.is_server)
            .finish()
    }
}

/// Datagrams received on a connection
///
/// Ends once the connection closes. Obtained once per connection from
/// [`Connection::datagrams`].
#[derive(Debug)]
pub struct Datagrams {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Datagrams {
    pub async fn next(&mut self) -> Option<Bytes> {
        poll_fn(|cx| self.rx.poll_recv(cx)).await
    }
}

impl futures::Stream for Datagrams {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// A user-facing handle, counted so that dropping the last one closes the connection
pub(crate) struct ConnectionRef(Arc<ConnectionInner>);

impl ConnectionRef {
    fn new(inner: Arc<ConnectionInner>) -> Self {
        inner.state.lock("new").ref_count += 1;
        Self(inner)
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        let live = {
            let state = &mut *self.0.state.lock("drop");
            state.ref_count = state.ref_count.saturating_sub(1);
            let live = matches!(
                state.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if state.ref_count == 0 && live {
                state.state = ConnectionState::ShuttingDown;
            }
            state.ref_count == 0 && live
        };
        if live {
            self.0.implicit_close();
        }
    }
}

impl std::ops::Deref for ConnectionRef {
    type Target = Arc<ConnectionInner>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub(crate) struct ConnectionInner {
    base: ObjectBase<Self>,
    runtime: Arc<dyn Runtime>,
    state: Mutex<State>,
    _registration: Registration,
}

impl NativeObject for ConnectionInner {
    fn base(&self) -> &ObjectBase<Self> {
        &self.base
    }
}

#[derive(Copy, Clone)]
enum Waiter {
    Plain,
    Timed,
}

/// A datagram the engine has not finished with
struct PendingDatagram {
    waiter: Option<oneshot::Sender<Result<(), Error>>>,
    /// Whether `datagram_send` has yet to return; the submitter then owns reclamation
    submitting: bool,
}

struct State {
    state: ConnectionState,
    is_server: bool,
    connect: Option<oneshot::Sender<Result<(), Error>>>,
    shutdown: Option<oneshot::Sender<()>>,
    timed_shutdown: Option<oneshot::Sender<()>>,
    /// Why the transport closed the connection, once it has
    close_error: Option<Error>,
    configuration: Option<Configuration>,
    /// Datagrams in flight, by the address of their send context
    datagrams: FxHashMap<usize, PendingDatagram>,
    datagrams_tx: Option<mpsc::UnboundedSender<Bytes>>,
    datagrams_rx: Option<Datagrams>,
    streams: Vec<Weak<StreamInner>>,
    peer_stream_handler: Option<PeerStreamHandler>,
    event_handler: Option<EventHandler>,
    certificate_validator: Option<CertificateValidator>,
    resumption_ticket: Option<Bytes>,
    negotiated_alpn: Option<Bytes>,
    /// Number of live `ConnectionRef`s
    ref_count: usize,
    /// Held for an accepted connection until it closes
    engine_ref: Option<ConnectionRef>,
}

impl ConnectionInner {
    fn new(
        registration: &Registration,
        runtime: Arc<dyn Runtime>,
        state: ConnectionState,
        is_server: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            base: ObjectBase::new(),
            runtime,
            state: Mutex::new(State {
                state,
                is_server,
                connect: None,
                shutdown: None,
                timed_shutdown: None,
                close_error: None,
                configuration: None,
                datagrams: FxHashMap::default(),
                datagrams_tx: Some(tx),
                datagrams_rx: Some(Datagrams { rx }),
                streams: Vec::new(),
                peer_stream_handler: None,
                event_handler: None,
                certificate_validator: None,
                resumption_ticket: None,
                negotiated_alpn: None,
                ref_count: 0,
                engine_ref: None,
            }),
            _registration: registration.clone(),
        })
    }

    /// Wrap a connection handed over by a listener
    pub(crate) fn accept(
        api: Api,
        registration: &Registration,
        runtime: Arc<dyn Runtime>,
        handle: Handle,
        configuration: &Configuration,
    ) -> Result<Connection, Error> {
        let inner = Self::new(registration, runtime, ConnectionState::Connecting, true);
        inner.base.set_handle(handle);
        inner.state.lock("accept").configuration = Some(configuration.clone());
        api.set_connection_callback(handle, connection_callback, inner.context());
        inner.retain_self_for_callback();
        if let Err(e) = api.connection_set_configuration(handle, configuration.handle()) {
            debug!(?handle, error = %e, "setting configuration on accepted connection failed");
            inner.state.lock("accept failed").state = ConnectionState::Closed;
            inner.release_self_from_callback();
            return Err(e);
        }
        trace!(?handle, "connection accepted");
        Ok(Connection(ConnectionRef::new(inner)))
    }

    fn begin_start(
        self: &Arc<Self>,
        configuration: &Configuration,
        server_name: &str,
        port: u16,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let api = api()?;
        let server_name = CString::new(server_name).map_err(|_| Error::InvalidParameter)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock("start");
            if state.state != ConnectionState::Idle || state.is_server {
                return Err(Error::InvalidState);
            }
            state.state = ConnectionState::Connecting;
            state.connect = Some(tx);
            state.configuration = Some(configuration.clone());
        }

        self.retain_self_for_callback();
        let result = api.connection_start(
            self.base.handle(),
            configuration.handle(),
            ADDRESS_FAMILY_UNSPEC,
            &server_name,
            port,
        );
        if let Err(e) = result {
            debug!(handle = ?self.base.handle(), error = %e, "connection start failed");
            {
                let mut state = self.state.lock("start failed");
                state.state = ConnectionState::Closed;
                state.connect = None;
            }
            self.release_self_from_callback();
            return Err(e);
        }
        trace!(handle = ?self.base.handle(), ?server_name, port, "connecting");
        Ok(rx)
    }

    fn begin_shutdown(
        &self,
        error_code: u64,
        kind: Waiter,
    ) -> Result<Option<oneshot::Receiver<()>>, Error> {
        let api = api()?;
        let (tx, rx) = oneshot::channel();
        let submit = {
            let mut state = self.state.lock("shutdown");
            match state.state {
                ConnectionState::Closed => return Ok(None),
                ConnectionState::Idle => {
                    state.state = ConnectionState::Closed;
                    return Ok(None);
                }
                _ => {}
            }
            let slot = match kind {
                Waiter::Plain => &mut state.shutdown,
                Waiter::Timed => &mut state.timed_shutdown,
            };
            if slot.is_some() {
                return Err(Error::InvalidState);
            }
            *slot = Some(tx);
            let submit = state.state != ConnectionState::ShuttingDown;
            state.state = ConnectionState::ShuttingDown;
            submit
        };
        if submit {
            debug!(handle = ?self.base.handle(), error_code, "shutting down connection");
            api.connection_shutdown(
                self.base.handle(),
                ConnectionShutdownFlags::NONE.bits(),
                error_code,
            );
        }
        Ok(Some(rx))
    }

    fn begin_send_datagram(
        &self,
        data: Bytes,
        flags: SendFlags,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let api = api()?;
        let ctx = SendContext::new((), data)?;
        let (tx, rx) = oneshot::channel();
        let (buffer, ctx) = {
            let mut state = self.state.lock("send_datagram");
            if state.state != ConnectionState::Connected {
                return Err(Error::InvalidState);
            }
            let (buffer, ctx) = ctx.into_raw();
            state.datagrams.insert(
                ctx as usize,
                PendingDatagram {
                    waiter: Some(tx),
                    submitting: true,
                },
            );
            (buffer, ctx)
        };

        let result = unsafe { api.datagram_send(self.base.handle(), buffer, flags.bits(), ctx) };
        let mut state = self.state.lock("send_datagram submitted");
        let reclaim = match (&result, state.datagrams.get_mut(&(ctx as usize))) {
            // Already resolved and reclaimed from a final state change
            (_, None) => false,
            (Ok(()), Some(pending)) => {
                pending.submitting = false;
                state.state == ConnectionState::Closed
            }
            (Err(_), Some(_)) => true,
        };
        if reclaim {
            state.datagrams.remove(&(ctx as usize));
            drop(state);
            drop(unsafe { SendContext::<()>::from_raw(ctx) });
        }
        result.map(|()| rx)
    }

    /// Ask the engine to close a connection nobody holds anymore
    fn implicit_close(&self) {
        let Ok(api) = api() else { return };
        debug!(handle = ?self.base.handle(), "last handle dropped, shutting down");
        api.connection_shutdown(self.base.handle(), ConnectionShutdownFlags::NONE.bits(), 0);
    }

    /// Close the native connection without waiting for the engine, then tear down
    fn force_close(&self) {
        if let Some(handle) = self.base.take_handle() {
            if let Ok(api) = api() {
                api.set_connection_callback(handle, connection_callback, ptr::null());
                api.connection_close(handle);
            }
        }
        self.terminate();
    }

    /// Parameters for windowed sends on this connection's streams
    ///
    /// Only available when the connection's configuration explicitly disables send buffering.
    pub(crate) fn windowed_send_bootstrap(&self) -> Result<u64, Error> {
        self.state
            .lock("windowed_send_bootstrap")
            .configuration
            .as_ref()
            .and_then(|config| config.settings().windowed_send_bootstrap())
            .ok_or(Error::InvalidState)
    }

    fn handle_event(self: &Arc<Self>, handle: Handle, event: ConnectionEvent) -> Status {
        let handler = self.state.lock("event handler").event_handler.clone();
        if let Some(handler) = handler {
            if let Err(e) = handler(&event) {
                trace!(?handle, error = %e, "event handler rejected event");
                return Status::from(e);
            }
        }

        match event {
            ConnectionEvent::Connected {
                session_resumed,
                negotiated_alpn,
            } => {
                debug!(?handle, session_resumed, alpn = ?negotiated_alpn, "connected");
                let waiter = {
                    let mut state = self.state.lock("connected");
                    if state.state == ConnectionState::Connecting {
                        state.state = ConnectionState::Connected;
                    }
                    state.negotiated_alpn = Some(negotiated_alpn);
                    state.connect.take()
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnectionEvent::ShutdownInitiatedByTransport { status, error_code } => {
                let error = match status.to_result() {
                    Ok(()) => Error::Aborted,
                    Err(e) => e,
                };
                debug!(?handle, %status, error_code, "transport shut down connection");
                self.shutdown_initiated(error);
            }
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => {
                debug!(?handle, error_code, "peer shut down connection");
                self.shutdown_initiated(Error::Aborted);
            }
            ConnectionEvent::ShutdownComplete {
                handshake_completed,
                peer_acknowledged_shutdown,
                app_close_in_progress,
            } => {
                debug!(
                    ?handle,
                    handshake_completed,
                    peer_acknowledged_shutdown,
                    app_close_in_progress,
                    "connection shutdown complete"
                );
                self.terminate();
            }
            ConnectionEvent::PeerStreamStarted { stream, flags } => {
                let Ok(api) = api() else {
                    return Status::SUCCESS;
                };
                let handler = self.state.lock("peer stream").peer_stream_handler.clone();
                match handler {
                    Some(handler) => {
                        trace!(?handle, ?stream, ?flags, "peer stream started");
                        let stream = Stream::adopt(api, self, stream);
                        self.runtime.spawn(handler(stream));
                    }
                    None => {
                        debug!(?handle, ?stream, "no peer stream handler, closing stream");
                        api.stream_close(stream);
                    }
                }
            }
            ConnectionEvent::DatagramReceived { data, .. } => {
                let state = self.state.lock("datagram received");
                if let Some(tx) = &state.datagrams_tx {
                    let _ = tx.send(data);
                }
            }
            ConnectionEvent::DatagramSendStateChanged { context, state } => {
                self.datagram_state_changed(context, state);
            }
            ConnectionEvent::ResumptionTicketReceived { ticket } => {
                trace!(?handle, len = ticket.len(), "resumption ticket received");
                self.state.lock("resumption ticket").resumption_ticket = Some(ticket);
            }
            ConnectionEvent::PeerCertificateReceived {
                certificate,
                deferred_status,
                ..
            } => {
                let deferred = deferred_status.to_result().err();
                let validator = self.state.lock("peer certificate").certificate_validator.clone();
                let result = match validator {
                    Some(validator) => validator(&certificate, deferred),
                    None => deferred.map_or(Ok(()), Err),
                };
                if let Err(e) = result {
                    debug!(?handle, error = %e, "peer certificate rejected");
                }
                return Status::from(result);
            }
            ConnectionEvent::LocalAddressChanged(addr) => {
                trace!(?handle, ?addr, "local address changed")
            }
            ConnectionEvent::PeerAddressChanged(addr) => {
                trace!(?handle, ?addr, "peer address changed")
            }
            ConnectionEvent::StreamsAvailable {
                bidirectional,
                unidirectional,
            } => trace!(?handle, bidirectional, unidirectional, "streams available"),
            ConnectionEvent::PeerNeedsStreams { bidirectional } => {
                trace!(?handle, bidirectional, "peer needs streams")
            }
            ConnectionEvent::IdealProcessorChanged { processor } => {
                trace!(?handle, processor, "ideal processor changed")
            }
            ConnectionEvent::DatagramStateChanged {
                send_enabled,
                max_send_length,
            } => trace!(?handle, send_enabled, max_send_length, "datagram state changed"),
            ConnectionEvent::Resumed { state } => {
                trace!(?handle, len = state.len(), "session resumed")
            }
            ConnectionEvent::Unknown(kind) => trace!(?handle, kind, "unknown connection event"),
        }
        Status::SUCCESS
    }

    fn shutdown_initiated(&self, error: Error) {
        let waiter = {
            let mut state = self.state.lock("shutdown initiated");
            if state.state != ConnectionState::Closed {
                state.state = ConnectionState::ShuttingDown;
            }
            state.close_error.get_or_insert(error);
            state.connect.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error));
        }
    }

    fn datagram_state_changed(&self, context: ClientContext, send_state: DatagramSendState) {
        let key = context.0 as usize;
        let (waiter, reclaim) = {
            let mut state = self.state.lock("datagram send state");
            let Some(pending) = state.datagrams.get_mut(&key) else {
                trace!(?send_state, "state change for an unknown datagram");
                return;
            };
            let waiter = match send_state.outcome() {
                Some(result) => pending.waiter.take().map(|waiter| (waiter, result)),
                None => None,
            };
            let reclaim = send_state.is_final();
            if reclaim {
                state.datagrams.remove(&key);
            }
            (waiter, reclaim)
        };
        if reclaim {
            drop(unsafe { SendContext::<()>::from_raw(context.0) });
        }
        if let Some((waiter, result)) = waiter {
            let _ = waiter.send(result);
        }
    }

    /// Resolve everything still pending once the connection is gone
    ///
    /// Runs at most once with effect; later calls find nothing left to resolve.
    fn terminate(&self) {
        let (connect, shutdown, timed, close_error, datagrams, streams, handlers, engine_ref) = {
            let mut state = self.state.lock("terminate");
            state.state = ConnectionState::Closed;
            state.datagrams_tx = None;
            // Contexts still being submitted are reclaimed by their submitter
            let mut datagrams = Vec::new();
            let mut waiters = Vec::new();
            state.datagrams.retain(|&key, pending| {
                waiters.extend(pending.waiter.take());
                if pending.submitting {
                    return true;
                }
                datagrams.push(key);
                false
            });
            (
                state.connect.take(),
                state.shutdown.take(),
                state.timed_shutdown.take(),
                state.close_error,
                (datagrams, waiters),
                mem::take(&mut state.streams),
                (
                    state.peer_stream_handler.take(),
                    state.event_handler.take(),
                    state.certificate_validator.take(),
                ),
                state.engine_ref.take(),
            )
        };
        // Handlers may hold connections of their own
        drop(handlers);
        drop(engine_ref);
        self.release_self_from_callback();

        if let Some(waiter) = shutdown {
            let _ = waiter.send(());
        }
        if let Some(waiter) = timed {
            let _ = waiter.send(());
        }
        if let Some(waiter) = connect {
            let _ = waiter.send(Err(close_error.unwrap_or(Error::Aborted)));
        }
        let (contexts, waiters) = datagrams;
        for key in contexts {
            drop(unsafe { SendContext::<()>::from_raw(key as *mut c_void) });
        }
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Aborted));
        }
        for stream in streams.iter().filter_map(Weak::upgrade) {
            stream.abort_waiters();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.base.take_handle() {
            if let Ok(api) = api() {
                api.set_connection_callback(handle, connection_callback, ptr::null());
                api.connection_close(handle);
            }
        }
        // The engine is done with a closed connection's datagrams
        let datagrams = mem::take(&mut self.state.lock("drop").datagrams);
        if !datagrams.is_empty() {
            warn!(count = datagrams.len(), "connection dropped with datagrams in flight");
        }
        for key in datagrams.into_keys() {
            drop(unsafe { SendContext::<()>::from_raw(key as *mut c_void) });
        }
    }
}

pub(crate) unsafe extern "C" fn connection_callback(
    handle: Handle,
    ctx: *mut c_void,
    event: *mut RawConnectionEvent,
) -> RawStatus {
    guard_callback("connection", || {
        let Some(connection) = (unsafe { recover::<ConnectionInner>(ctx) }) else {
            return Status::SUCCESS;
        };
        let event = unsafe { ConnectionEvent::from_raw(&*event) };
        connection.handle_event(handle, event)
    })
}
