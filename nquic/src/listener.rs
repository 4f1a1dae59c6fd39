use std::{ffi::c_void, fmt, net::SocketAddr, ptr, sync::Arc};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    api::{api, Api},
    configuration::{alpn_buffers, alpn_list, Configuration},
    connection::{Connection, ConnectionInner},
    error::Error,
    event::{ListenerEvent, NewConnectionInfo},
    ffi::{param, Handle, RawAddr, RawListenerEvent, RawStatus},
    mutex::Mutex,
    object::{guard_callback, recover, NativeObject, ObjectBase},
    registration::Registration,
    runtime::{default_runtime, Runtime},
    status::Status,
};

type Acceptor = dyn Fn(&NewConnectionInfo, Incoming) -> Result<Connection, Error> + Send + Sync;

/// Accepts incoming connections
///
/// Every connection attempt is offered to the acceptor passed to [`Listener::new`]. The acceptor
/// either calls [`Incoming::accept`] and returns the connection, or returns an error to refuse
/// it. The acceptor runs on an engine thread and must not block.
///
/// Dropping a started listener stops it.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Open a listener whose accepted connections spawn work on the current Tokio runtime
    ///
    /// The connection returned by `acceptor` stays up until it closes, even once every handle to it
    /// is dropped.
    pub fn new<F>(registration: &Registration, acceptor: F) -> Result<Self, Error>
    where
        F: Fn(&NewConnectionInfo, Incoming) -> Result<Connection, Error> + Send + Sync + 'static,
    {
        let runtime = default_runtime().ok_or(Error::InvalidState)?;
        Self::with_runtime(registration, runtime, acceptor)
    }

    pub fn with_runtime<F>(
        registration: &Registration,
        runtime: Arc<dyn Runtime>,
        acceptor: F,
    ) -> Result<Self, Error>
    where
        F: Fn(&NewConnectionInfo, Incoming) -> Result<Connection, Error> + Send + Sync + 'static,
    {
        let api = api()?;
        let inner = Arc::new(ListenerInner {
            base: ObjectBase::new(),
            registration: registration.clone(),
            runtime,
            acceptor: Box::new(acceptor),
            state: Mutex::new(State {
                started: false,
                stop: None,
            }),
        });
        let handle = api.listener_open(registration.handle(), listener_callback, inner.context())?;
        inner.base.set_handle(handle);
        trace!(?handle, "listener opened");
        Ok(Self { inner })
    }

    /// Start accepting connections offering one of `alpns`
    ///
    /// Binds `local_address`, or an address of the engine's choosing if `None`. Fails with
    /// [`Error::InvalidState`] if already started.
    pub fn start<A: AsRef<[u8]>>(
        &self,
        alpns: &[A],
        local_address: Option<SocketAddr>,
    ) -> Result<(), Error> {
        let api = api()?;
        let alpns: Vec<Bytes> = alpn_list(alpns)?;
        let buffers = alpn_buffers(&alpns)?;
        let address = local_address.map(RawAddr::from);
        {
            let mut state = self.inner.state.lock("start");
            if state.started {
                return Err(Error::InvalidState);
            }
            state.started = true;
        }

        self.inner.retain_self_for_callback();
        let handle = self.inner.base.handle();
        if let Err(e) = api.listener_start(handle, &buffers, address.as_ref()) {
            debug!(?handle, error = %e, "listener start failed");
            self.inner.state.lock("start failed").started = false;
            self.inner.release_self_from_callback();
            return Err(e);
        }
        debug!(?handle, ?local_address, "listening");
        Ok(())
    }

    /// Stop accepting connections, completing once the engine confirms
    ///
    /// Does nothing if the listener is not started.
    pub async fn stop(&self) -> Result<(), Error> {
        if let Some(rx) = self.inner.begin_stop()? {
            let _ = rx.await;
        }
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        let raw = api()?
            .get_param_value::<RawAddr>(self.inner.base.handle(), param::LISTENER_LOCAL_ADDRESS)?;
        raw.to_socket_addr().ok_or(Error::InvalidState)
    }

    pub fn is_valid(&self) -> bool {
        self.inner.base.is_valid()
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> Handle {
        self.inner.base.handle()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("handle", &self.inner.base.handle())
            .field("started", &self.inner.state.lock("fmt").started)
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // The stop completion releases the listener
        let _ = self.inner.begin_stop();
    }
}

struct ListenerInner {
    base: ObjectBase<Self>,
    registration: Registration,
    runtime: Arc<dyn Runtime>,
    acceptor: Box<Acceptor>,
    state: Mutex<State>,
}

impl NativeObject for ListenerInner {
    fn base(&self) -> &ObjectBase<Self> {
        &self.base
    }
}

struct State {
    started: bool,
    stop: Option<oneshot::Sender<()>>,
}

impl ListenerInner {
    fn begin_stop(&self) -> Result<Option<oneshot::Receiver<()>>, Error> {
        let api = api()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock("stop");
            if !state.started {
                return Ok(None);
            }
            if state.stop.is_some() {
                return Err(Error::InvalidState);
            }
            state.stop = Some(tx);
        }
        api.listener_stop(self.base.handle());
        Ok(Some(rx))
    }

    fn handle_event(&self, api: Api, handle: Handle, event: ListenerEvent) -> Status {
        match event {
            ListenerEvent::NewConnection { info, connection } => {
                trace!(
                    ?handle,
                    ?connection,
                    remote = ?info.remote_address,
                    server_name = %info.server_name,
                    "new connection"
                );
                let incoming = Incoming {
                    api,
                    handle: Some(connection),
                    registration: self.registration.clone(),
                    runtime: self.runtime.clone(),
                };
                match (self.acceptor)(&info, incoming) {
                    Ok(conn) => {
                        conn.hand_to_engine();
                        Status::SUCCESS
                    }
                    Err(e) => {
                        debug!(?handle, ?connection, error = %e, "connection refused");
                        Status::CONNECTION_REFUSED
                    }
                }
            }
            ListenerEvent::StopComplete {
                app_close_in_progress,
            } => {
                debug!(?handle, app_close_in_progress, "listener stopped");
                let waiter = {
                    let mut state = self.state.lock("stop complete");
                    state.started = false;
                    state.stop.take()
                };
                self.release_self_from_callback();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
                Status::SUCCESS
            }
            ListenerEvent::Unknown(kind) => {
                trace!(?handle, kind, "unknown listener event");
                Status::SUCCESS
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.base.take_handle() {
            if let Ok(api) = api() {
                api.set_listener_callback(handle, listener_callback, ptr::null());
                api.listener_close(handle);
            }
        }
    }
}

unsafe extern "C" fn listener_callback(
    handle: Handle,
    ctx: *mut c_void,
    event: *mut RawListenerEvent,
) -> RawStatus {
    guard_callback("listener", || {
        let Some(listener) = (unsafe { recover::<ListenerInner>(ctx) }) else {
            return Status::SUCCESS;
        };
        let Ok(api) = api() else {
            return Status::INVALID_STATE;
        };
        let event = unsafe { ListenerEvent::from_raw(&*event) };
        listener.handle_event(api, handle, event)
    })
}

/// A connection attempt offered to a listener's acceptor
///
/// Dropping it without calling [`accept`](Self::accept) closes the attempt.
pub struct Incoming {
    api: Api,
    handle: Option<Handle>,
    registration: Registration,
    runtime: Arc<dyn Runtime>,
}

impl Incoming {
    /// Take over the connection, completing its handshake with `configuration`
    pub fn accept(mut self, configuration: &Configuration) -> Result<Connection, Error> {
        let handle = self.handle.take().ok_or(Error::InvalidState)?;
        ConnectionInner::accept(
            self.api,
            &self.registration,
            self.runtime.clone(),
            handle,
            configuration,
        )
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming").field("handle", &self.handle).finish()
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!(?handle, "closing unaccepted connection");
            self.api.connection_close(handle);
        }
    }
}
