//! The transaction server's page-server pool.
//!
//! Owns one [`ConnectionHandler`] per configured page server (priority =
//! configuration order), routes synchronous request/response traffic
//! through a single *main* connection with transparent failover, keeps the
//! pool healthy with a background reconnector, and computes the quorum
//! consensus LSA that gates user-visible commits.
//!
//! ```text
//!  commit threads ──▶ wait_for_flushed_lsa ──▶ QuorumFlushGate
//!                                                  ▲ wakeup
//!  PriorSender ──▶ per-handler sinks ──▶ PS ──▶ saved-LSA reports
//!
//!  request threads ──▶ push_request / send_receive ──▶ main connection
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use kestrel_common::config::TxServerConfig;
use kestrel_common::error::{TxResult, TxServerError};
use kestrel_common::shutdown::StopSignal;
use kestrel_common::types::{parse_host_list, HostPort, Lsa, MvccId, VOLID_MAX};

use crate::active::{ActiveVariant, MainInfoFn};
use crate::connection::{ConnState, ConnectionHandler};
use crate::connector::PsConnector;
use crate::disconnector::AsyncDisconnector;
use crate::messages::{decode_mvccid, decode_volume_count, ConnectionType, TranToPageRequest};
use crate::prior::LogContext;

/// How often boot re-checks for a live connection while waiting for the
/// first catch-up to finish.
const BOOT_RETRY_INTERVAL: Duration = Duration::from_millis(30);

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters exposed by the pool.
#[derive(Debug, Default)]
pub struct TxServerStats {
    /// One-way requests dropped because no page server was available.
    pub dropped_pushes: AtomicU64,
    /// Times the main connection moved to a different handler.
    pub main_switches: AtomicU64,
    /// Successful reconnects performed by the background connector.
    pub reconnects: AtomicU64,
}

impl TxServerStats {
    pub fn snapshot(&self) -> TxServerStatsSnapshot {
        TxServerStatsSnapshot {
            dropped_pushes: self.dropped_pushes.load(Ordering::Relaxed),
            main_switches: self.main_switches.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TxServerStats`].
#[derive(Debug, Clone, Copy)]
pub struct TxServerStatsSnapshot {
    pub dropped_pushes: u64,
    pub main_switches: u64,
    pub reconnects: u64,
}

/// Point-in-time view of one handler, for observability and tests.
#[derive(Debug, Clone)]
pub struct HandlerSnapshot {
    pub endpoint: HostPort,
    pub state: ConnState,
    pub saved_lsa: Lsa,
}

// ---------------------------------------------------------------------------
// Server core
// ---------------------------------------------------------------------------

/// Shared state behind [`TransactionServer`]. Background threads hold weak
/// references into this.
pub(crate) struct ServerCore {
    config: TxServerConfig,
    conn_type: ConnectionType,
    server_name: Mutex<String>,
    /// Append-only after boot; no reordering, no deletion.
    handlers: RwLock<Vec<Arc<ConnectionHandler>>>,
    /// The handler synchronous traffic routes through. Non-null only while
    /// it points at a CONNECTED handler.
    main_conn: RwLock<Option<Arc<ConnectionHandler>>>,
    log_ctx: Arc<LogContext>,
    disconnector: Arc<AsyncDisconnector>,
    connector: PsConnector,
    stats: TxServerStats,
}

impl ServerCore {
    /// Pick the first CONNECTED handler in configuration order as the main
    /// connection. Fails when none is connected.
    pub(crate) fn reset_main_connection(&self) -> TxResult<()> {
        let mut main = self.main_conn.write();
        let handlers = self.handlers.read();

        let candidate = handlers.iter().find(|h| h.is_connected());
        let Some(candidate) = candidate else {
            return Err(TxServerError::NoPageServerAvailable);
        };

        let changed = match main.as_ref() {
            Some(current) => !Arc::ptr_eq(current, candidate),
            None => true,
        };
        if changed {
            *main = Some(Arc::clone(candidate));
            self.stats.main_switches.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %candidate.endpoint(), "main page server connection set");
        }
        Ok(())
    }

    pub(crate) fn main_connection_info(&self) -> Option<HostPort> {
        self.main_conn.read().as_ref().map(|h| h.endpoint().clone())
    }

    /// One reconnect pass, in priority order. Aborts early on stop.
    pub(crate) fn try_connect_idle_handlers(&self, stop: &StopSignal) {
        let handlers: Vec<_> = self.handlers.read().clone();
        let mut newly_connected = false;

        for handler in handlers {
            if handler.is_idle() && handler.connect().is_ok() {
                newly_connected = true;
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            if stop.stop_requested() {
                return;
            }
        }

        if newly_connected {
            // The fresh connection may still be catching up (CONNECTING);
            // once it turns CONNECTED a later pass promotes it if needed.
            if let Err(e) = self.reset_main_connection() {
                tracing::debug!(error = %e, "no live connection to promote after reconnect pass");
            }
        }
    }

    /// The highest LSA that a majority of the *configured* page servers has
    /// durably flushed, judging from the currently connected ones. Null
    /// when fewer than the quorum are connected.
    pub(crate) fn compute_consensus_lsa(&self) -> Lsa {
        let handlers = self.handlers.read();
        let total = handlers.len();
        let mut collected: Vec<Lsa> = handlers
            .iter()
            .filter(|h| h.is_connected())
            .map(|h| h.saved_lsa())
            .collect();
        drop(handlers);

        let quorum = total / 2 + 1;
        let connected = collected.len();
        let consensus = consensus_from_collected(quorum, &mut collected);

        if self.config.log_quorum_consensus {
            if connected < quorum {
                // Not sorted by the computation in this case; sort for the log.
                collected.sort_unstable();
            }
            let saved_list = collected
                .iter()
                .map(Lsa::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(
                total,
                connected,
                quorum,
                consensus = %consensus,
                saved = %saved_list,
                "consensus LSA: quorum {}",
                if connected < quorum { "unsatisfied" } else { "satisfied" },
            );
        }

        consensus
    }
}

/// With `collected` sorted ascending, the element at `len - quorum` is the
/// highest LSA that at least `quorum` of the reporting servers have
/// reached. Null when fewer than `quorum` report:
///
/// - collected `[5, 5, 6, 9, 10]`, quorum 3 → 6
/// - collected `[9, 10]`, quorum 2 → 9
/// - collected `[5, 6, 9, 10]`, quorum 3 → 6
fn consensus_from_collected(quorum: usize, collected: &mut [Lsa]) -> Lsa {
    if collected.len() < quorum {
        return Lsa::NULL;
    }
    collected.sort_unstable();
    collected[collected.len() - quorum]
}

// ---------------------------------------------------------------------------
// Transaction server
// ---------------------------------------------------------------------------

/// See the module docs.
pub struct TransactionServer {
    core: Arc<ServerCore>,
    shut_down: AtomicBool,
}

impl TransactionServer {
    /// Create a pool with its own fresh [`LogContext`].
    pub fn new(config: TxServerConfig) -> Self {
        Self::with_log_context(config, Arc::new(LogContext::new()))
    }

    /// Create a pool around an existing log context (the log subsystem and
    /// this pool share the prior sender and the flush gate).
    pub fn with_log_context(config: TxServerConfig, log_ctx: Arc<LogContext>) -> Self {
        TransactionServer {
            core: Arc::new(ServerCore {
                config,
                conn_type: ConnectionType::ActiveTransactionServer,
                server_name: Mutex::new(String::new()),
                handlers: RwLock::new(Vec::new()),
                main_conn: RwLock::new(None),
                log_ctx,
                disconnector: Arc::new(AsyncDisconnector::new()),
                connector: PsConnector::new(),
                stats: TxServerStats::default(),
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn log_context(&self) -> &Arc<LogContext> {
        &self.core.log_ctx
    }

    pub fn stats(&self) -> TxServerStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Per-handler view for observability.
    pub fn handler_snapshots(&self) -> Vec<HandlerSnapshot> {
        self.core
            .handlers
            .read()
            .iter()
            .map(|h| HandlerSnapshot {
                endpoint: h.endpoint().clone(),
                state: h.state(),
                saved_lsa: h.saved_lsa(),
            })
            .collect()
    }

    /// Bring the pool up: parse and validate the host list, connect to
    /// every configured page server, wait for a main connection to become
    /// live, start the reconnector and (under remote storage) verify the
    /// request path with a boot-info round trip.
    pub fn boot(&self, db_name: &str) -> TxResult<()> {
        *self.core.server_name.lock() = db_name.to_string();
        tracing::info!(db = db_name, "booting page server pool");

        self.init_page_server_hosts()?;

        if !self.core.handlers.read().is_empty() {
            // At least one page server is configured. Even without remote
            // storage the remote log replica may exist, so wait for a main
            // connection; catch-up can take a while after the channel opens.
            let deadline =
                Instant::now() + Duration::from_millis(self.core.config.boot_conn_timeout_ms);
            loop {
                match self.core.reset_main_connection() {
                    Ok(()) => break,
                    Err(e) => {
                        if Instant::now() >= deadline {
                            tracing::error!(
                                "no page server connection became live within the boot window"
                            );
                            return Err(e);
                        }
                        thread::sleep(BOOT_RETRY_INTERVAL);
                    }
                }
            }

            self.core.connector.start(
                &self.core,
                Duration::from_millis(self.core.config.reconnect_interval_ms),
            );
        }

        if self.core.config.remote_storage {
            self.get_boot_info_from_page_server()?;
        }

        Ok(())
    }

    fn init_page_server_hosts(&self) -> TxResult<()> {
        debug_assert!(self.core.handlers.read().is_empty());
        let cfg = &self.core.config;

        if cfg.page_server_hosts.is_empty() {
            return if cfg.remote_storage {
                tracing::error!("remote storage is configured but page_server_hosts is empty");
                Err(TxServerError::EmptyPageServerHosts)
            } else {
                // No page server, local storage.
                Ok(())
            };
        }

        let mut parse_failures = 0usize;
        for entry in parse_host_list(&cfg.page_server_hosts) {
            match entry {
                Ok(endpoint) => self.register_connection_handler(endpoint),
                Err(e) => {
                    tracing::warn!(error = %e, "bad page server host entry");
                    parse_failures += 1;
                }
            }
        }

        let handlers: Vec<_> = self.core.handlers.read().clone();
        if handlers.is_empty() {
            return Err(TxServerError::HostPortParameter(
                cfg.page_server_hosts.clone(),
            ));
        }
        if parse_failures > 0 {
            // At least one entry is usable; the bad ones were reported above
            // and are otherwise ignored.
            tracing::warn!(parse_failures, "ignoring invalid page server host entries");
        }

        let mut connected = 0usize;
        for handler in &handlers {
            match handler.connect() {
                Ok(()) => connected += 1,
                Err(e) => {
                    tracing::warn!(peer = %handler.endpoint(), error = %e, "initial page server connect failed")
                }
            }
        }

        if connected == 0 && cfg.remote_storage {
            tracing::error!("remote storage is configured but no page server could be reached");
            return Err(TxServerError::NoPageServerConnection);
        }

        tracing::info!(
            configured = handlers.len(),
            connected,
            storage = if cfg.remote_storage { "remote" } else { "local" },
            "page server pool initialized"
        );
        Ok(())
    }

    fn register_connection_handler(&self, endpoint: HostPort) {
        let weak = Arc::downgrade(&self.core);
        let main_info: MainInfoFn =
            Box::new(move || weak.upgrade().and_then(|core| core.main_connection_info()));
        let variant = ActiveVariant::new(Arc::clone(&self.core.log_ctx), main_info);

        let handler = ConnectionHandler::new(
            endpoint,
            self.core.conn_type,
            Box::new(variant),
            Arc::clone(&self.core.disconnector),
        );
        self.core.handlers.write().push(handler);
    }

    /// One-way request through the main connection. When the main
    /// connection dies mid-send the request is transparently retried on the
    /// next live handler; when no page server is available the push is
    /// dropped (counted in [`TxServerStats::dropped_pushes`]).
    pub fn push_request(&self, req: TranToPageRequest, payload: Bytes) {
        loop {
            let guard = self.core.main_conn.read();
            let attempt = guard
                .as_ref()
                .map(|main| (main.push_request(req, payload.clone()), main.is_connected()));
            drop(guard);

            match attempt {
                Some((Ok(()), _)) => return,
                // Failed but the connection is still up: the push is gone,
                // by the one-way contract.
                Some((Err(_), true)) => return,
                Some((Err(_), false)) | None => {
                    if self.core.reset_main_connection().is_err() {
                        self.core
                            .stats
                            .dropped_pushes
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(?req, "dropping one-way request: no page server available");
                        return;
                    }
                }
            }
        }
    }

    /// Request/response round trip through the main connection, with the
    /// same transparent failover as [`TransactionServer::push_request`].
    /// Fails with `NoPageServerAvailable` when the pool is empty.
    pub fn send_receive(&self, req: TranToPageRequest, payload: Bytes) -> TxResult<Bytes> {
        loop {
            let guard = self.core.main_conn.read();
            let attempt = guard
                .as_ref()
                .map(|main| (main.send_receive(req, payload.clone()), main.is_connected()));
            drop(guard);

            match attempt {
                Some((Ok(response), _)) => return Ok(response),
                Some((Err(e), true)) => return Err(e),
                Some((Err(_), false)) | None => self.core.reset_main_connection()?,
            }
        }
    }

    /// Verify the request path end to end. The reply carries a permanent
    /// volume count whose value is a fixed sentinel; the count itself is
    /// unused.
    fn get_boot_info_from_page_server(&self) -> TxResult<()> {
        let response = self.send_receive(TranToPageRequest::GetBootInfo, Bytes::new())?;
        let nvols = decode_volume_count(&response)?;
        debug_assert_eq!(nvols, VOLID_MAX);
        if nvols != VOLID_MAX {
            return Err(TxServerError::BootInfoMismatch {
                expected: VOLID_MAX,
                got: nvols,
            });
        }
        Ok(())
    }

    /// Ask the main page server for the oldest MVCCID still active
    /// anywhere. Returns [`MvccId::NULL`] when no page server can answer.
    pub fn get_oldest_active_mvccid(&self) -> MvccId {
        let response = match self.send_receive(TranToPageRequest::GetOldestActiveMvccid, Bytes::new())
        {
            Ok(response) => response,
            Err(_) => return MvccId::NULL,
        };
        match decode_mvccid(&response) {
            Ok(id) => {
                // ALL_VISIBLE means the page server is still waiting for
                // its first visibility update from a passive server.
                debug_assert!(id.is_normal() || id == MvccId::ALL_VISIBLE);
                id
            }
            Err(e) => {
                tracing::error!(error = %e, "bad oldest-active-MVCCID reply");
                MvccId::NULL
            }
        }
    }

    pub fn is_page_server_connected(&self) -> bool {
        self.core.handlers.read().iter().any(|h| h.is_connected())
    }

    pub fn get_main_connection_info(&self) -> Option<HostPort> {
        self.core.main_connection_info()
    }

    /// See [`ServerCore::compute_consensus_lsa`].
    pub fn compute_consensus_lsa(&self) -> Lsa {
        self.core.compute_consensus_lsa()
    }

    /// Block the calling (commit) thread until a majority of the page
    /// servers has durably flushed the log up to `target`.
    pub fn wait_for_flushed_lsa(&self, target: Lsa) {
        let core = Arc::clone(&self.core);
        self.core
            .log_ctx
            .flush_gate()
            .wait_for_flushed_lsa(target, move || core.compute_consensus_lsa());

        if self.core.config.log_quorum_consensus {
            tracing::info!(
                flushed = %self.core.log_ctx.flush_gate().consensus_flushed_lsa(),
                "quorum satisfied: page servers flushed past target"
            );
        }
    }

    /// Disconnect every page server with a goodbye message. Teardowns are
    /// all started before any is joined so they overlap.
    pub fn disconnect_all_page_servers(&self) {
        self.core.connector.terminate();

        let handlers: Vec<_> = self.core.handlers.read().clone();
        for handler in &handlers {
            handler.disconnect_async(true);
        }
        for handler in &handlers {
            handler.wait_async_disconnection();
        }

        *self.core.main_conn.write() = None;
        tracing::info!("disconnected from all page servers");
    }

    /// Full teardown: disconnect everything and stop the background
    /// threads. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect_all_page_servers();
        self.core.disconnector.terminate();
    }
}

impl Drop for TransactionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
