//! Cooperative cancellation via stop tokens.
//!
//! A [`StopSource`] owns the stop state; [`StopToken`]s are cheap
//! clones observing it. An in-flight operation registers a callback
//! through [`StopToken::register`]; firing the source runs every
//! registered callback exactly once, on the thread that called
//! [`StopSource::request_stop`]. Callbacks registered after the stop
//! was requested run inline.
//!
//! The tokens are handed to I/O awaitables (`read_some`, `accept`,
//! timer waits) which arrange for the awaiting task to resume with
//! `Canceled` when the token fires, regardless of how the race with
//! normal completion resolves.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StopState {
    stopped: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Owner of a stop state; requesting a stop fires all registered
/// callbacks and makes every associated [`StopToken`] report stopped.
#[derive(Default)]
pub struct StopSource {
    state: Arc<StopState>,
}

impl StopSource {
    /// Creates a new, unstopped source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> StopToken {
        StopToken {
            state: self.state.clone(),
        }
    }

    /// Requests a stop. The first call runs all registered callbacks;
    /// subsequent calls are no-ops.
    pub fn request_stop(&self) {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        for (_, cb) in callbacks {
            cb();
        }
    }

    /// Returns true if a stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

/// Observer handle for a [`StopSource`].
#[derive(Clone)]
pub struct StopToken {
    state: Arc<StopState>,
}

impl StopToken {
    /// Returns true if the associated source has been stopped.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// Registers a callback to run when the source is stopped.
    ///
    /// If the source is already stopped, the callback runs inline and
    /// `None` is returned. Otherwise the returned registration removes
    /// the callback when dropped.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Option<StopRegistration> {
        if self.stop_requested() {
            callback();
            return None;
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.state.callbacks.lock();
            // request_stop may have drained the list while we were
            // acquiring the lock; run inline in that case.
            if self.stop_requested() {
                drop(callbacks);
                callback();
                return None;
            }
            callbacks.push((id, Box::new(callback)));
        }
        Some(StopRegistration {
            state: self.state.clone(),
            id,
        })
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

/// Removes a registered stop callback when dropped.
pub struct StopRegistration {
    state: Arc<StopState>,
    id: u64,
}

impl Drop for StopRegistration {
    fn drop(&mut self) {
        let mut callbacks = self.state.callbacks.lock();
        if let Some(pos) = callbacks.iter().position(|(id, _)| *id == self.id) {
            callbacks.swap_remove(pos);
        }
    }
}
