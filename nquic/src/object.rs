use std::{
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use tracing::error;

use crate::{ffi::Handle, mutex::Mutex, status::Status};

/// State shared by every wrapper around a native handle
///
/// Holds the handle itself and the self-reference that keeps the wrapper alive while the engine
/// may still call back into it.
pub(crate) struct ObjectBase<T> {
    handle: AtomicPtr<c_void>,
    retained: Mutex<Option<Arc<T>>>,
}

impl<T> ObjectBase<T> {
    pub(crate) fn new() -> Self {
        Self {
            handle: AtomicPtr::new(ptr::null_mut()),
            retained: Mutex::new(None),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle(self.handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.0, Ordering::Release);
    }

    /// Take the handle out for closing, so that it is closed at most once
    pub(crate) fn take_handle(&self) -> Option<Handle> {
        let handle = Handle(self.handle.swap(ptr::null_mut(), Ordering::AcqRel));
        (!handle.is_null()).then_some(handle)
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.handle().is_null()
    }

    #[cfg(test)]
    pub(crate) fn is_retained(&self) -> bool {
        self.retained.lock("is_retained").is_some()
    }
}

/// A wrapper the engine calls back into through a context pointer
pub(crate) trait NativeObject: Sized + Send + Sync + 'static {
    fn base(&self) -> &ObjectBase<Self>;

    /// Keep `self` alive until [`release_self_from_callback`](Self::release_self_from_callback)
    ///
    /// Idempotent: at most one extra reference is held.
    fn retain_self_for_callback(self: &Arc<Self>) {
        let mut retained = self.base().retained.lock("retain");
        if retained.is_none() {
            *retained = Some(self.clone());
        }
    }

    /// Drop the reference taken by [`retain_self_for_callback`](Self::retain_self_for_callback)
    ///
    /// Safe to call any number of times. Only called from terminal events or when the submission
    /// that would have produced one failed, never from `Drop`.
    fn release_self_from_callback(&self) {
        let released = self.base().retained.lock("release").take();
        // Dropped outside the lock: this may be the last reference
        drop(released);
    }

    /// The context pointer registered with the engine for this object
    fn context(self: &Arc<Self>) -> *const c_void {
        Arc::as_ptr(self).cast()
    }
}

/// Recover an owned reference from a context pointer handed back by the engine
///
/// # Safety
///
/// `ctx` must be null or a pointer obtained from [`NativeObject::context`] for an object that is
/// still alive. Objects keep themselves alive while callbacks can arrive, and detach their
/// context before closing their handle.
pub(crate) unsafe fn recover<T>(ctx: *mut c_void) -> Option<Arc<T>> {
    if ctx.is_null() {
        return None;
    }
    let ptr = ctx as *const T;
    // The callback gets its own strong reference, so releasing the self-retain mid-callback
    // cannot free the object under it.
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }
}

/// Run a callback body, turning a panic into an error status instead of unwinding into C
pub(crate) fn guard_callback(kind: &'static str, f: impl FnOnce() -> Status) -> u32 {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status.0,
        Err(_) => {
            error!(kind, "panic in event handler");
            Status::INTERNAL_ERROR.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Probe {
        base: ObjectBase<Self>,
    }

    impl NativeObject for Probe {
        fn base(&self) -> &ObjectBase<Self> {
            &self.base
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn retain_and_release_are_idempotent() {
        let probe = Arc::new(Probe {
            base: ObjectBase::new(),
        });
        probe.retain_self_for_callback();
        probe.retain_self_for_callback();
        assert_eq!(Arc::strong_count(&probe), 2);
        assert!(probe.base.is_retained());

        let ctx = probe.context() as *mut c_void;
        let before = DROPS.load(Ordering::SeqCst);
        drop(probe);
        let recovered = unsafe { recover::<Probe>(ctx) }.unwrap();
        recovered.release_self_from_callback();
        recovered.release_self_from_callback();
        assert_eq!(Arc::strong_count(&recovered), 1);
        assert_eq!(DROPS.load(Ordering::SeqCst), before);
        drop(recovered);
        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn handle_taken_once() {
        let base = ObjectBase::<()>::new();
        assert!(!base.is_valid());
        base.set_handle(Handle(8 as *mut c_void));
        assert!(base.is_valid());
        assert_eq!(base.take_handle(), Some(Handle(8 as *mut c_void)));
        assert_eq!(base.take_handle(), None);
    }

    #[test]
    fn null_context_recovers_nothing() {
        assert!(unsafe { recover::<Probe>(ptr::null_mut()) }.is_none());
    }

    #[test]
    fn panics_become_internal_error() {
        let status = guard_callback("test", || panic!("boom"));
        assert_eq!(status, Status::INTERNAL_ERROR.0);
        assert_eq!(guard_callback("test", || Status::PENDING), Status::PENDING.0);
    }
}
