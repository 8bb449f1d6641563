//! Background reconnector over idle page server entries.
//!
//! Page servers come and go; a handler whose connection failed returns to
//! IDLE and stays there until this daemon's next pass re-attempts the
//! connect. Passes run on a fixed interval and abort early on termination.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kestrel_common::shutdown::StopSignal;

use crate::server::ServerCore;

/// See the module docs.
pub(crate) struct PsConnector {
    stop: StopSignal,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PsConnector {
    pub(crate) fn new() -> Self {
        PsConnector {
            stop: StopSignal::new(),
            thread: parking_lot::Mutex::new(None),
        }
    }

    /// Start the reconnect loop. Called once, after the initial connect
    /// pass has registered the handlers.
    pub(crate) fn start(&self, core: &Arc<ServerCore>, interval: Duration) {
        debug_assert!(self.thread.lock().is_none());

        let weak: Weak<ServerCore> = Arc::downgrade(core);
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("kestrel-ps-connector".into())
            .spawn(move || loop {
                if stop.wait_for(interval) {
                    return;
                }
                let Some(core) = weak.upgrade() else {
                    return;
                };
                core.try_connect_idle_handlers(&stop);
            })
            .unwrap_or_else(|e| {
                tracing::error!("failed to spawn page server connector: {e}");
                panic!("page server connector thread spawn failed");
            });

        *self.thread.lock() = Some(handle);
    }

    /// Stop and join the loop. Idempotent; safe to call when never started.
    pub(crate) fn terminate(&self) {
        self.stop.request_stop();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
