//! Per-page-server connection handler.
//!
//! One handler per configured page server, owned by the transaction
//! server's handler vector for the whole process lifetime. The handler is a
//! state machine:
//!
//! ```text
//!          connect()              catch-up complete
//!   IDLE ───────────▶ CONNECTING ─────────────────▶ CONNECTED
//!    ▲                    │                             │
//!    │                    │ connect failure             │ error handler /
//!    │                    ▼                             ▼ explicit
//!    └──────────── DISCONNECTING ◀──────────────────────┘
//!        teardown job done
//! ```
//!
//! Server-variant behavior (catch-up, log fan-out, saved-LSA tracking) hangs
//! off a [`ConnectionVariant`] hook object instead of a subclass.
//!
//! Lock order is state → channel. Request paths take both shared and drop
//! the state lock before blocking in I/O, so a concurrent disconnect can
//! mark the handler DISCONNECTING and stop the channel, which wakes the
//! blocked caller with an error.

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use kestrel_common::error::{TxResult, TxServerError};
use kestrel_common::types::{AtomicLsa, HostPort, Lsa};

use crate::channel::{
    self, InboundHandler, InboundHandlerMap, PsChannel, RecvErrorHandler, SendErrorHandler,
};
use crate::disconnector::AsyncDisconnector;
use crate::messages::{encode_connection_type, ConnectionType, PageToTranRequest, TranToPageRequest};

/// Connect and handshake must finish within this window; the reconnector
/// retries failed entries every few seconds anyway.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection handler state. Transitions only through the methods of
/// [`ConnectionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Idle => write!(f, "IDLE"),
            ConnState::Connecting => write!(f, "CONNECTING"),
            ConnState::Connected => write!(f, "CONNECTED"),
            ConnState::Disconnecting => write!(f, "DISCONNECTING"),
        }
    }
}

/// Server-variant hooks of a connection handler.
///
/// The base state machine is common to every transaction-server variant;
/// what differs is what happens when a channel opens (catch-up initiation),
/// what must be unhooked on disconnect, and which unsolicited page server
/// requests are understood.
pub trait ConnectionVariant: Send + Sync {
    /// Called after the channel is open and installed, outside the state
    /// lock. The handler is still CONNECTING; the variant decides what
    /// completes the transition.
    fn transition_to_connected(&self, conn: &Arc<ConnectionHandler>);

    /// Called at the start of teardown, before the channel is stopped.
    fn on_disconnecting(&self, conn: &ConnectionHandler);

    /// Additional inbound request handlers beyond the base set.
    fn extra_request_handlers(
        &self,
        conn: &Arc<ConnectionHandler>,
    ) -> Vec<(PageToTranRequest, InboundHandler)>;
}

/// See the module docs.
pub struct ConnectionHandler {
    endpoint: HostPort,
    conn_type: ConnectionType,
    state: RwLock<ConnState>,
    /// Present in CONNECTING and CONNECTED, null otherwise.
    channel: RwLock<Option<Arc<PsChannel>>>,
    /// Latest durably-flushed position reported by this page server.
    /// Non-decreasing for the process lifetime.
    saved_lsa: AtomicLsa,
    /// Completion latch of the in-flight teardown job, if any.
    disconnect_done: Mutex<Option<mpsc::Receiver<()>>>,
    variant: Box<dyn ConnectionVariant>,
    disconnector: Arc<AsyncDisconnector>,
    /// Back-reference handed to channel closures and teardown jobs.
    self_weak: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    pub fn new(
        endpoint: HostPort,
        conn_type: ConnectionType,
        variant: Box<dyn ConnectionVariant>,
        disconnector: Arc<AsyncDisconnector>,
    ) -> Arc<ConnectionHandler> {
        Arc::new_cyclic(|self_weak| ConnectionHandler {
            endpoint,
            conn_type,
            state: RwLock::new(ConnState::Idle),
            channel: RwLock::new(None),
            saved_lsa: AtomicLsa::default(),
            disconnect_done: Mutex::new(None),
            variant,
            disconnector,
            self_weak: self_weak.clone(),
        })
    }

    pub fn endpoint(&self) -> &HostPort {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnState::Connected
    }

    pub fn is_idle(&self) -> bool {
        *self.state.read() == ConnState::Idle
    }

    pub fn saved_lsa(&self) -> Lsa {
        self.saved_lsa.load()
    }

    pub(crate) fn store_saved_lsa(&self, lsa: Lsa) {
        self.saved_lsa.store(lsa);
    }

    /// Open the channel to this page server: connect, run the
    /// connection-type echo handshake, install the channel and let the
    /// variant start its catch-up. On success the handler is CONNECTING
    /// until the variant completes the transition.
    pub fn connect(&self) -> TxResult<()> {
        let connect_failed = |state: &mut ConnState, err: &dyn std::fmt::Display| {
            *state = ConnState::Idle;
            tracing::debug!(peer = %self.endpoint, error = %err, "page server connect failed");
            TxServerError::PageServerConnection {
                host: self.endpoint.host.clone(),
            }
        };

        let mut state = self.state.write();
        if *state != ConnState::Idle {
            debug_assert!(false, "connect() on a non-idle handler ({})", *state);
            return Err(TxServerError::PageServerConnection {
                host: self.endpoint.host.clone(),
            });
        }
        *state = ConnState::Connecting;

        let stream = match channel::connect_with_handshake(
            &self.endpoint.host,
            self.endpoint.port,
            self.conn_type.code(),
            CONNECT_TIMEOUT,
        ) {
            Ok(stream) => stream,
            Err(e) => return Err(connect_failed(&mut state, &e)),
        };

        let chan = match PsChannel::start(
            stream,
            self.endpoint.to_string(),
            self.request_handlers(),
            PageToTranRequest::Respond.code(),
            self.send_error_handler(),
            self.recv_error_handler(),
        ) {
            Ok(chan) => chan,
            Err(e) => return Err(connect_failed(&mut state, &e)),
        };

        {
            let mut slot = self.channel.write();
            debug_assert!(slot.is_none());
            *slot = Some(chan);
        }
        drop(state);

        tracing::debug!(peer = %self.endpoint, "connected to page server");

        // Variant-specific work before the connection opens for request
        // traffic; CONNECTED is reached under the variant's control.
        if let Some(this) = self.self_weak.upgrade() {
            self.variant.transition_to_connected(&this);
        }

        Ok(())
    }

    /// One-way request through this handler. Fails when the handler is not
    /// CONNECTED.
    pub fn push_request(&self, req: TranToPageRequest, payload: Bytes) -> TxResult<()> {
        let state = self.state.read();
        if *state != ConnState::Connected {
            return Err(TxServerError::PageServerUnreachable);
        }
        // CONNECTED guarantees the channel is installed.
        let chan = self.channel.read();
        drop(state);

        match chan.as_ref() {
            Some(chan) => chan
                .push(req.code(), payload)
                .map_err(|_| TxServerError::PageServerUnreachable),
            None => {
                debug_assert!(false, "CONNECTED handler without a channel");
                Err(TxServerError::PageServerUnreachable)
            }
        }
    }

    /// One-way request that skips the state check. Only for variant hooks
    /// that must send while CONNECTING (catch-up, prior-log streaming that
    /// began just before a state change). Errors surface through the
    /// channel's error handlers.
    pub fn push_request_regardless_of_state(&self, req: TranToPageRequest, payload: Bytes) {
        let chan = self.channel.read();
        if let Some(chan) = chan.as_ref() {
            let _ = chan.push(req.code(), payload);
        }
    }

    /// Request/response round trip through this handler. The state lock is
    /// released before blocking so a concurrent disconnect can proceed; the
    /// caller then wakes with an error.
    pub fn send_receive(&self, req: TranToPageRequest, payload: Bytes) -> TxResult<Bytes> {
        let state = self.state.read();
        if *state != ConnState::Connected {
            return Err(TxServerError::PageServerUnreachable);
        }
        let chan = self.channel.read();
        drop(state);

        let Some(chan) = chan.as_ref() else {
            debug_assert!(false, "CONNECTED handler without a channel");
            return Err(TxServerError::PageServerUnreachable);
        };
        chan.send_recv(req.code(), payload)
            .map_err(|_| TxServerError::PageServerUnreachable)
    }

    /// Begin asynchronous teardown. Idempotent: a handler that is already
    /// IDLE or DISCONNECTING is left alone. The actual teardown runs on the
    /// reaper thread; at most one job per handler is in flight.
    pub fn disconnect_async(&self, send_goodbye: bool) {
        {
            let mut state = self.state.write();
            if matches!(*state, ConnState::Idle | ConnState::Disconnecting) {
                return;
            }
            *state = ConnState::Disconnecting;
        }

        let (done_tx, done_rx) = mpsc::channel();
        *self.disconnect_done.lock() = Some(done_rx);

        let Some(handler) = self.self_weak.upgrade() else {
            return;
        };
        self.disconnector.submit(Box::new(move || {
            handler.run_teardown(send_goodbye);
            let _ = done_tx.send(());
        }));
    }

    /// Join the in-flight teardown job, if any. The handler is IDLE on
    /// return.
    pub fn wait_async_disconnection(&self) {
        let done = self.disconnect_done.lock().take();
        if let Some(done) = done {
            let _ = done.recv();
        }
        debug_assert!(self.is_idle());
    }

    /// The teardown job body, run on the reaper thread.
    fn run_teardown(&self, send_goodbye: bool) {
        self.variant.on_disconnecting(self);

        // Stop the incoming side first, outside the state and channel write
        // locks: blocked send_receive callers hold the channel lock shared
        // and only release it once their round trip fails.
        let chan = self.channel.read().clone();
        if let Some(chan) = chan {
            chan.stop_incoming();
        }

        let mut state = self.state.write();
        let mut slot = self.channel.write();
        debug_assert_eq!(*state, ConnState::Disconnecting);

        if send_goodbye {
            if let Some(chan) = slot.as_ref() {
                // The page server may release every resource tied to this
                // connection on receipt, so this must be the last message.
                chan.push_final(
                    TranToPageRequest::SendDisconnectMsg.code(),
                    encode_connection_type(self.conn_type),
                );
            }
        }

        *slot = None;
        *state = ConnState::Idle;
        drop(slot);
        drop(state);

        tracing::debug!(peer = %self.endpoint, "disconnected from page server");
    }

    /// Transition CONNECTING → CONNECTED once catch-up has finished.
    pub(crate) fn mark_catchup_complete(&self) {
        let mut state = self.state.write();
        debug_assert_eq!(*state, ConnState::Connecting);
        if *state == ConnState::Connecting {
            *state = ConnState::Connected;
            tracing::debug!(peer = %self.endpoint, "catch-up complete; connection is live");
        }
    }

    fn request_handlers(&self) -> InboundHandlerMap {
        let mut handlers = InboundHandlerMap::new();

        let weak = self.self_weak.clone();
        handlers.insert(
            PageToTranRequest::SendDisconnectRequestMsg.code(),
            Box::new(move |_payload: Bytes| {
                if let Some(handler) = weak.upgrade() {
                    handler.disconnect_async(true);
                }
            }) as InboundHandler,
        );

        if let Some(this) = self.self_weak.upgrade() {
            for (req, handler) in self.variant.extra_request_handlers(&this) {
                handlers.insert(req.code(), handler);
            }
        }
        handlers
    }

    fn send_error_handler(&self) -> SendErrorHandler {
        let weak = self.self_weak.clone();
        let peer = self.endpoint.to_string();
        Box::new(move |err, abort_further| {
            *abort_further = false;
            if err.is_disconnection() {
                *abort_further = true;
                tracing::debug!(peer = %peer, "send error: abnormal disconnection detected");
                if let Some(handler) = weak.upgrade() {
                    handler.disconnect_async(false);
                }
            } else {
                tracing::debug!(peer = %peer, error = %err, "send error on page server channel");
            }
        })
    }

    fn recv_error_handler(&self) -> RecvErrorHandler {
        let weak = self.self_weak.clone();
        let peer = self.endpoint.to_string();
        Box::new(move |_err| {
            tracing::debug!(peer = %peer, "recv error: abnormal disconnection detected");
            if let Some(handler) = weak.upgrade() {
                handler.disconnect_async(false);
            }
        })
    }
}
