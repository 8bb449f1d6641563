//! Shared leaf crate for the Kestrel transaction server: log positions,
//! MVCC identifiers, host endpoints, typed errors, configuration and the
//! interruptible stop signal used by background threads.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::TxServerConfig;
pub use error::{ChannelError, TxResult, TxServerError};
pub use shutdown::StopSignal;
pub use types::{AtomicLsa, HostPort, Lsa, MvccId, VOLID_MAX};
