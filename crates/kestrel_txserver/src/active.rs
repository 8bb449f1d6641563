//! Connection-handler hooks of the active transaction server.
//!
//! The active variant is the log producer: on every fresh channel it
//! registers a prior-list sink, asks the page server to catch up from the
//! position the sink will stream from, and tracks the saved LSAs the page
//! server reports back for the commit flush gate.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use kestrel_common::types::HostPort;

use crate::channel::InboundHandler;
use crate::connection::{ConnectionHandler, ConnectionVariant};
use crate::messages::{decode_lsa, encode_start_catch_up, PageToTranRequest, TranToPageRequest};
use crate::prior::{LogContext, SinkId};

/// Provides the endpoint of the current main connection, the node a
/// catching-up page server should source historical log from.
pub type MainInfoFn = Box<dyn Fn() -> Option<HostPort> + Send + Sync>;

/// See the module docs.
pub struct ActiveVariant {
    log_ctx: Arc<LogContext>,
    main_info: MainInfoFn,
    sink_id: Mutex<Option<SinkId>>,
}

impl ActiveVariant {
    pub fn new(log_ctx: Arc<LogContext>, main_info: MainInfoFn) -> Self {
        ActiveVariant {
            log_ctx,
            main_info,
            sink_id: Mutex::new(None),
        }
    }
}

impl ConnectionVariant for ActiveVariant {
    fn transition_to_connected(&self, conn: &Arc<ConnectionHandler>) {
        debug_assert!(self.sink_id.lock().is_none());

        // The sink streams prior-list chunks to this page server for as
        // long as the connection lives; the sender is driven externally, so
        // the push ignores the connection state.
        let weak = Arc::downgrade(conn);
        let (sink_id, unsent_lsa) =
            self.log_ctx
                .prior_sender()
                .add_sink(Box::new(move |message: &Bytes| {
                    debug_assert!(!message.is_empty());
                    if let Some(handler) = weak.upgrade() {
                        handler.push_request_regardless_of_state(
                            TranToPageRequest::SendLogPriorList,
                            message.clone(),
                        );
                    }
                }));
        *self.sink_id.lock() = Some(sink_id);

        // Catch-up is sourced from the current main connection. Before the
        // log subsystem initializes there is no main connection yet; the
        // request then carries the sentinel endpoint and the null LSA.
        let (host, port) = if unsent_lsa.is_null() {
            ("N/A".to_string(), -1)
        } else {
            match (self.main_info)() {
                Some(main) => {
                    let port = i32::from(main.port);
                    (main.host, port)
                }
                None => {
                    debug_assert!(false, "live log stream without a main connection");
                    ("N/A".to_string(), -1)
                }
            }
        };

        conn.push_request_regardless_of_state(
            TranToPageRequest::SendStartCatchUp,
            encode_start_catch_up(&host, port, unsent_lsa),
        );
        // The handler stays CONNECTING until the catch-up completion
        // arrives.
    }

    fn on_disconnecting(&self, _conn: &ConnectionHandler) {
        if let Some(id) = self.sink_id.lock().take() {
            self.log_ctx.prior_sender().remove_sink(id);
        }
    }

    fn extra_request_handlers(
        &self,
        conn: &Arc<ConnectionHandler>,
    ) -> Vec<(PageToTranRequest, InboundHandler)> {
        let saved_lsa_handler: InboundHandler = {
            let weak = Arc::downgrade(conn);
            let log_ctx = Arc::clone(&self.log_ctx);
            Box::new(move |payload: Bytes| {
                let Some(handler) = weak.upgrade() else {
                    return;
                };
                let received = match decode_lsa(&payload) {
                    Ok(lsa) => lsa,
                    Err(e) => {
                        tracing::error!(peer = %handler.endpoint(), error = %e, "bad saved-LSA payload");
                        return;
                    }
                };

                let current = handler.saved_lsa();
                // A page server may resend its latest value, but never an
                // older one.
                debug_assert!(received >= current);
                tracing::trace!(peer = %handler.endpoint(), %received, "received saved LSA");

                if received > current {
                    handler.store_saved_lsa(received);
                    log_ctx.flush_gate().wakeup_flush_waiters();
                }
            })
        };

        let catchup_complete_handler: InboundHandler = {
            let weak = Arc::downgrade(conn);
            Box::new(move |_payload: Bytes| {
                if let Some(handler) = weak.upgrade() {
                    handler.mark_catchup_complete();
                }
            })
        };

        vec![
            (PageToTranRequest::SendSavedLsa, saved_lsa_handler),
            (PageToTranRequest::SendCatchupComplete, catchup_complete_handler),
        ]
    }
}
