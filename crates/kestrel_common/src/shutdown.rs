//! Interruptible stop signal for background threads.
//!
//! Background loops that sleep between passes must still wind down promptly
//! on shutdown, so their sleeps go through a Condvar instead of
//! `thread::sleep`: `request_stop()` wakes every sleeper immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cooperative stop flag shared between a control thread and the background
/// threads it owns. Cloning shares the underlying flag.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop and wake every thread blocked in [`StopSignal::wait_for`].
    /// Idempotent.
    pub fn request_stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cv.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for at most `timeout`, waking early on stop. Returns true when
    /// stop has been requested and the caller should exit its loop.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.stop_requested() {
            return true;
        }
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _unused = self
            .inner
            .cv
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.stop_requested()
    }
}
