use thiserror::Error;

/// Convenience alias for `Result<T, TxServerError>`.
pub type TxResult<T> = Result<T, TxServerError>;

/// Error classification, used to decide whether a failure is recovered
/// locally (reconnect / main-connection reset) or surfaced to the caller.
///
/// - `Config`: host-list parsing / validation before any I/O
/// - `Connect`: channel open or handshake failure; the reconnector retries
/// - `Transport`: send/recv failure on an established connection
/// - `Unavailable`: no page server can serve the request right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connect,
    Transport,
    Unavailable,
}

/// Top-level error type of the transaction-server coordinator.
#[derive(Error, Debug)]
pub enum TxServerError {
    #[error("invalid page server host entry '{0}' (expected host:port with port in 1..65535)")]
    HostPortParameter(String),

    #[error("page_server_hosts is empty but remote storage is configured")]
    EmptyPageServerHosts,

    #[error("failed to establish a connection to page server {host}")]
    PageServerConnection { host: String },

    #[error("could not connect to any page server")]
    NoPageServerConnection,

    #[error("no page server is available")]
    NoPageServerAvailable,

    #[error("page server cannot be reached")]
    PageServerUnreachable,

    #[error("boot info mismatch: expected permanent volume sentinel {expected}, got {got}")]
    BootInfoMismatch { expected: u16, got: u16 },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl TxServerError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxServerError::HostPortParameter(_) => ErrorKind::Config,
            TxServerError::EmptyPageServerHosts => ErrorKind::Config,
            TxServerError::PageServerConnection { .. } => ErrorKind::Connect,
            TxServerError::NoPageServerConnection => ErrorKind::Connect,
            TxServerError::NoPageServerAvailable => ErrorKind::Unavailable,
            TxServerError::PageServerUnreachable => ErrorKind::Transport,
            TxServerError::BootInfoMismatch { .. } => ErrorKind::Transport,
            TxServerError::Channel(_) => ErrorKind::Transport,
        }
    }

    /// Returns true when the failure is expected to clear once a page server
    /// connection is (re)established.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Config)
    }
}

/// Wire-channel failures. These never escape the connection handler: the
/// handler converts them into [`TxServerError::PageServerUnreachable`] and
/// lets its error handlers drive the disconnect.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer closed the socket, or the channel was torn down while a
    /// request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was stopped locally; no further traffic is accepted.
    #[error("channel stopped")]
    Stopped,

    #[error("handshake mismatch: sent connection type {sent}, peer echoed {echoed}")]
    HandshakeMismatch { sent: i32, echoed: i32 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Map an I/O error to the channel-level failure it represents. Peer
    /// teardown shows up as one of several `ErrorKind`s depending on timing.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        match err.kind() {
            K::UnexpectedEof | K::ConnectionReset | K::ConnectionAborted | K::BrokenPipe => {
                ChannelError::ConnectionClosed
            }
            _ => ChannelError::Io(err),
        }
    }

    /// True for failures meaning the peer is gone rather than a local fault.
    pub fn is_disconnection(&self) -> bool {
        matches!(self, ChannelError::ConnectionClosed)
    }
}
