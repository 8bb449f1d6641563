//! Commit gate over the page servers' durably flushed log positions.
//!
//! Commit threads block in [`QuorumFlushGate::wait_for_flushed_lsa`] until a
//! majority of the connected page servers has flushed up to their target
//! position. The gate caches the last agreed position; recomputing it is the
//! job of exactly one waiter at a time, elected by the `up_to_date` flag:
//! whoever flips it from false to true runs the consensus computation while
//! everyone else sleeps on the condition variable. A new saved-LSA report
//! clears the flag and wakes the waiters, so the cycle repeats until the
//! target is covered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use kestrel_common::types::Lsa;

/// See the module docs.
pub struct QuorumFlushGate {
    /// The highest LSA a majority of connected page servers is known to
    /// have flushed. Non-decreasing.
    consensus_flushed_lsa: Mutex<Lsa>,
    /// False whenever a saved-LSA report may have moved the consensus
    /// forward since it was last computed.
    up_to_date: AtomicBool,
    cv: Condvar,
}

impl QuorumFlushGate {
    pub fn new() -> Self {
        QuorumFlushGate {
            consensus_flushed_lsa: Mutex::new(Lsa::NULL),
            up_to_date: AtomicBool::new(false),
            cv: Condvar::new(),
        }
    }

    /// The last agreed flushed position.
    pub fn consensus_flushed_lsa(&self) -> Lsa {
        *self
            .consensus_flushed_lsa
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the consensus flushed position reaches `target`.
    ///
    /// `compute` performs the consensus computation over the current
    /// saved-LSA reports; it returns [`Lsa::NULL`] while the quorum is not
    /// met, in which case the updater retries instead of publishing (the
    /// reports themselves keep changing underneath).
    pub fn wait_for_flushed_lsa<F>(&self, target: Lsa, compute: F)
    where
        F: Fn() -> Lsa,
    {
        let mut consensus = self
            .consensus_flushed_lsa
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        while *consensus < target {
            // Only the thread that first notices the cache is stale
            // recomputes; the rest sleep until it publishes.
            if !self.up_to_date.swap(true, Ordering::SeqCst) {
                let fresh = compute();
                if fresh.is_null() {
                    // Quorum not met. Re-check rather than wait: the flag is
                    // ours now, so the next pass goes to sleep until a new
                    // report clears it.
                    continue;
                }
                debug_assert!(*consensus <= fresh);
                *consensus = fresh;
                self.cv.notify_all();
            } else {
                consensus = self
                    .cv
                    .wait(consensus)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    /// Called whenever a page server reports a higher saved LSA: mark the
    /// cached consensus stale and wake the waiters so one of them
    /// recomputes.
    pub fn wakeup_flush_waiters(&self) {
        // Taking the mutex orders the flag flip against a waiter that is
        // between its staleness check and its sleep.
        let _guard = self
            .consensus_flushed_lsa
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.up_to_date.store(false, Ordering::SeqCst);
        self.cv.notify_all();
    }
}

impl Default for QuorumFlushGate {
    fn default() -> Self {
        Self::new()
    }
}
