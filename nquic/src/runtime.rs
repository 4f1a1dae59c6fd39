use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

/// Abstracts the executor that runs work spawned from engine callbacks
///
/// Engine callbacks arrive on threads the binding does not control and must return quickly, so
/// anything that needs to await (such as the handler for a peer-initiated stream) is handed to a
/// `Runtime` instead.
pub trait Runtime: Send + Sync + Debug + 'static {
    /// Drive `future` to completion in the background
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Automatically select the runtime for the calling context
///
/// Returns a [`TokioRuntime`] bound to the current Tokio runtime if there is one, `None`
/// otherwise.
pub fn default_runtime() -> Option<Arc<dyn Runtime>> {
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| Arc::new(TokioRuntime::new(handle)) as Arc<dyn Runtime>)
}

/// A runtime for Tokio
///
/// Holds a handle rather than calling `tokio::spawn` directly, because engine threads are not
/// inside a Tokio runtime context.
#[derive(Debug, Clone)]
pub struct TokioRuntime {
    handle: tokio::runtime::Handle,
}

impl TokioRuntime {
    /// Spawn onto the runtime behind `handle`
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Runtime for TokioRuntime {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self.handle.spawn(future);
    }
}
