//! Off-path teardown of page server connections.
//!
//! Tearing a connection down blocks on socket shutdown and a thread join,
//! so it never runs on the thread that noticed the failure. The handler
//! marks itself DISCONNECTING and hands the teardown job to this reaper;
//! a single worker thread drains the queue and runs the jobs in FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A queued teardown. Runs exactly once on the worker thread.
pub type TeardownJob = Box<dyn FnOnce() + Send>;

const WORKER_WAIT: Duration = Duration::from_secs(1);

struct Shared {
    queue: Mutex<VecDeque<TeardownJob>>,
    cv: Condvar,
    terminated: AtomicBool,
}

/// See the module docs.
pub struct AsyncDisconnector {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDisconnector {
    /// Create the reaper and start its worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            terminated: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("kestrel-disconnector".into())
            .spawn(move || worker_loop(worker_shared))
            .unwrap_or_else(|e| {
                tracing::error!("failed to spawn disconnector worker: {e}");
                panic!("disconnector worker thread spawn failed");
            });

        AsyncDisconnector {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a teardown job. Submitting after [`AsyncDisconnector::terminate`]
    /// is a programming error; the job is dropped.
    pub fn submit(&self, job: TeardownJob) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            debug_assert!(false, "disconnect submitted after termination");
            tracing::error!("disconnect submitted after termination; dropping");
            return;
        }
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queue.push_back(job);
        drop(queue);
        self.shared.cv.notify_one();
    }

    /// Stop the worker after it has drained the queue, and join it.
    /// Idempotent.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.cv.notify_one();

        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }

        debug_assert!(self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty());
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }
}

impl Default for AsyncDisconnector {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        // Swap the queue into a local buffer so the lock is not held while
        // jobs run.
        let batch: VecDeque<TeardownJob> = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.is_empty() {
                if shared.terminated.load(Ordering::SeqCst) {
                    return;
                }
                let (guard, _timeout) = shared
                    .cv
                    .wait_timeout(queue, WORKER_WAIT)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
            }
            std::mem::take(&mut *queue)
        };

        for job in batch {
            job();
        }
    }
}
