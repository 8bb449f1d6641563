//! Page-server side of the Kestrel transaction server.
//!
//! In the disaggregated deployment the transaction server executes SQL and
//! produces log records while a set of page server replicas persists pages
//! and log. This crate is the transaction server's coordinator over those
//! replicas:
//!
//! - one [`connection::ConnectionHandler`] per configured page server, a
//!   state machine over a framed TCP [`channel`] with handshake, catch-up
//!   and asynchronous teardown;
//! - fan-out of the log prior list through [`prior::PriorSender`] sinks,
//!   one per live connection;
//! - a single *main* connection for synchronous request traffic, selected
//!   and failed over by [`server::TransactionServer`];
//! - a background reconnector and an off-path disconnect reaper;
//! - the [`flush_gate::QuorumFlushGate`], which blocks commit threads until
//!   a majority of page servers has durably flushed their target LSA.

pub mod active;
pub mod channel;
pub mod connection;
mod connector;
pub mod disconnector;
pub mod flush_gate;
pub mod messages;
pub mod prior;
pub mod server;

pub use active::ActiveVariant;
pub use connection::{ConnState, ConnectionHandler, ConnectionVariant};
pub use disconnector::AsyncDisconnector;
pub use flush_gate::QuorumFlushGate;
pub use messages::{ConnectionType, PageToTranRequest, TranToPageRequest};
pub use prior::{LogContext, PriorSender, SinkId};
pub use server::{HandlerSnapshot, TransactionServer, TxServerStats, TxServerStatsSnapshot};
