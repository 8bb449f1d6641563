use serde::{Deserialize, Serialize};

/// Configuration of the transaction server's page-server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxServerConfig {
    /// Comma-separated `host:port` list of page servers, in priority order.
    /// The first connected entry becomes the main connection.
    #[serde(default)]
    pub page_server_hosts: String,

    /// When true, the data volumes live on the page servers and booting
    /// without at least one page server connection is an error.
    #[serde(default)]
    pub remote_storage: bool,

    /// When true, every consensus-LSA computation logs the collected
    /// saved-LSA list and the decision.
    #[serde(default)]
    pub log_quorum_consensus: bool,

    /// Interval between reconnect passes over idle page server entries
    /// (milliseconds).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// How long boot waits for the first main connection to come up
    /// (milliseconds). Catch-up with a page server can take a while after
    /// the channel itself is open.
    #[serde(default = "default_boot_conn_timeout_ms")]
    pub boot_conn_timeout_ms: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_boot_conn_timeout_ms() -> u64 {
    30_000
}

impl Default for TxServerConfig {
    fn default() -> Self {
        Self {
            page_server_hosts: String::new(),
            remote_storage: false,
            log_quorum_consensus: false,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            boot_conn_timeout_ms: default_boot_conn_timeout_ms(),
        }
    }
}
