use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::PoisonError,
};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use super::*;
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };
    use tracing::warn;

    /// Holds over this long stall an engine worker noticeably
    const SLOW: Duration = Duration::from_millis(1);
    const RECENT_HOLDERS: usize = 20;

    #[derive(Debug)]
    struct Inner<T> {
        /// Most recent first, with how long each kept the object's state
        recent_holders: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// Per-object state lock which records who held it and for how long
    ///
    /// Engine callbacks take the same lock as application calls, so a slow holder stalls an
    /// engine worker thread. Slow waits and holds are reported through `tracing`, naming the
    /// recent holders.
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: Debug> std::fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            std::fmt::Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    recent_holders: VecDeque::with_capacity(RECENT_HOLDERS),
                    value,
                }),
            }
        }

        /// Take the object's state for `purpose`, which is recorded as a recent holder
        ///
        /// A lock poisoned by a panicking callback is taken over as is.
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let requested = Instant::now();
            let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let acquired = Instant::now();
            let waited = acquired.duration_since(requested);
            if waited > SLOW {
                warn!(
                    purpose,
                    ?waited,
                    recent = ?guard.recent_holders,
                    "slow to acquire object state"
                );
            }
            MutexGuard {
                guard,
                acquired,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        acquired: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            let held = self.acquired.elapsed();
            if held > SLOW {
                warn!(purpose = self.purpose, ?held, "object state held too long");
            }
            let holders = &mut self.guard.recent_holders;
            holders.truncate(RECENT_HOLDERS - 1);
            holders.push_front((self.purpose, held));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.guard.value
        }
    }
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::Mutex;

#[cfg(not(feature = "lock_tracking"))]
mod non_tracking {
    use super::*;

    /// Per-object state lock
    ///
    /// Never held across an `.await` or a call into the engine.
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        /// Take the object's state; `purpose` is only recorded with `lock_tracking`
        ///
        /// A lock poisoned by a panicking callback is taken over as is.
        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, T>,
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.guard.deref()
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.guard.deref_mut()
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use non_tracking::Mutex;
