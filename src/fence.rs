//! GPU synchronization fences as the queue observes them.
//!
//! A fence has exactly two observable states, pending and signaled, plus a
//! signal timestamp once it fires. The queue never waits on fences itself;
//! it stores them, hands them across the boundary, and polls their state
//! when making latching decisions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Nsecs;

/// Signal time reported while a fence has not signaled yet.
pub const SIGNAL_TIME_PENDING: Nsecs = i64::MAX;

/// Signal time reported for the "already signaled" sentinel.
pub const SIGNAL_TIME_INVALID: Nsecs = -1;

/// A shared handle to a GPU-side synchronization object.
///
/// `Fence::signaled()` produces the sentinel used wherever the original
/// submitter had nothing to wait on; it is not backed by any sync object
/// and always reports [`SIGNAL_TIME_INVALID`].
#[derive(Debug, Clone, Default)]
pub struct Fence {
    inner: Option<Arc<Mutex<Option<Nsecs>>>>,
}

impl Fence {
    /// A pending fence. It stays pending until [`Fence::signal`] is called.
    pub fn new() -> Fence {
        Fence {
            inner: Some(Arc::new(Mutex::new(None))),
        }
    }

    /// The sentinel fence that counts as already signaled.
    pub fn signaled() -> Fence {
        Fence { inner: None }
    }

    /// Whether this fence is backed by a real sync object.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Marks the fence signaled at time `when`. Signaling twice keeps the
    /// first timestamp.
    pub fn signal(&self, when: Nsecs) {
        if let Some(inner) = &self.inner {
            let mut state = inner.lock().unwrap();
            if state.is_none() {
                *state = Some(when);
            }
        }
    }

    /// The time this fence signaled, [`SIGNAL_TIME_PENDING`] if it has not,
    /// or [`SIGNAL_TIME_INVALID`] for the sentinel.
    pub fn signal_time(&self) -> Nsecs {
        match &self.inner {
            None => SIGNAL_TIME_INVALID,
            Some(inner) => inner.lock().unwrap().unwrap_or(SIGNAL_TIME_PENDING),
        }
    }

    /// True unless the fence is still pending. The sentinel counts as
    /// signaled.
    pub fn has_signaled(&self) -> bool {
        self.signal_time() != SIGNAL_TIME_PENDING
    }
}

/// A fence whose signal time is cached once known, so that bookkeeping
/// structures can poll cheaply long after the fence itself is gone.
#[derive(Debug)]
pub struct FenceTime {
    fence: Fence,
    signal_time: AtomicI64,
}

impl FenceTime {
    pub fn new(fence: Fence) -> FenceTime {
        let signal_time = match fence.is_valid() {
            true => SIGNAL_TIME_PENDING,
            false => SIGNAL_TIME_INVALID,
        };
        FenceTime {
            fence,
            signal_time: AtomicI64::new(signal_time),
        }
    }

    /// Whether the underlying fence was a real sync object.
    pub fn is_valid(&self) -> bool {
        self.fence.is_valid()
    }

    /// Polls the fence if needed and returns the cached signal time.
    pub fn signal_time(&self) -> Nsecs {
        let cached = self.signal_time.load(Ordering::Acquire);
        if cached != SIGNAL_TIME_PENDING {
            return cached;
        }
        let polled = self.fence.signal_time();
        if polled != SIGNAL_TIME_PENDING {
            self.signal_time.store(polled, Ordering::Release);
        }
        polled
    }

    pub fn has_signaled(&self) -> bool {
        self.signal_time() != SIGNAL_TIME_PENDING
    }
}
