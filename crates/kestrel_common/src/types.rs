//! Core value types: log sequence addresses, MVCC identifiers and page
//! server endpoints.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TxServerError;

// ---------------------------------------------------------------------------
// Log sequence address
// ---------------------------------------------------------------------------

/// A position in the log stream: `(page_id, offset)`, totally ordered
/// lexicographically.
///
/// The all-zero value is the null sentinel and sorts strictly below every
/// real position; the log producer never emits a record at page 0 offset 0.
/// The pair packs into a single `u64` whose numeric order equals the
/// lexicographic order, which is what makes [`AtomicLsa`] a single atomic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsa {
    pub page_id: u32,
    pub offset: u32,
}

impl Lsa {
    /// The null sentinel, strictly less than any real log position.
    pub const NULL: Lsa = Lsa {
        page_id: 0,
        offset: 0,
    };

    /// Size of the wire encoding: `page_id` LE u32 followed by `offset` LE u32.
    pub const WIRE_SIZE: usize = 8;

    pub const fn new(page_id: u32, offset: u32) -> Self {
        Lsa { page_id, offset }
    }

    pub const fn is_null(self) -> bool {
        self.page_id == 0 && self.offset == 0
    }

    /// Pack into a `u64` preserving order: `page_id` in the high half.
    pub const fn to_packed(self) -> u64 {
        ((self.page_id as u64) << 32) | self.offset as u64
    }

    pub const fn from_packed(packed: u64) -> Self {
        Lsa {
            page_id: (packed >> 32) as u32,
            offset: packed as u32,
        }
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.page_id, self.offset)
    }
}

/// An [`Lsa`] that can be read and written atomically.
///
/// Backed by the packed `u64` form, so a store is one atomic op and readers
/// never observe a torn pair.
#[derive(Debug)]
pub struct AtomicLsa(AtomicU64);

impl AtomicLsa {
    pub fn new(lsa: Lsa) -> Self {
        AtomicLsa(AtomicU64::new(lsa.to_packed()))
    }

    pub fn load(&self) -> Lsa {
        Lsa::from_packed(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, lsa: Lsa) {
        self.0.store(lsa.to_packed(), Ordering::SeqCst);
    }
}

impl Default for AtomicLsa {
    fn default() -> Self {
        AtomicLsa::new(Lsa::NULL)
    }
}

// ---------------------------------------------------------------------------
// MVCC identifier
// ---------------------------------------------------------------------------

/// Monotonic transaction identifier used for MVCC visibility decisions.
///
/// Values below [`MvccId::FIRST_NORMAL`] are sentinels; a page server
/// reports [`MvccId::ALL_VISIBLE`] while it is still waiting for the first
/// visibility update from a passive transaction server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MvccId(pub u64);

impl MvccId {
    pub const NULL: MvccId = MvccId(0);
    pub const ALL_VISIBLE: MvccId = MvccId(3);
    pub const FIRST_NORMAL: MvccId = MvccId(4);

    /// Size of the wire encoding: LE u64.
    pub const WIRE_SIZE: usize = 8;

    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }
}

impl fmt::Display for MvccId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sentinel permanent-volume count returned in the boot-info reply. The
/// transaction server only checks it as a liveness probe of the request
/// path; the count itself is unused.
pub const VOLID_MAX: u16 = 0x7fff;

// ---------------------------------------------------------------------------
// Page server endpoint
// ---------------------------------------------------------------------------

/// A `host:port` page server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// Parse a single `host:port` token. The colon must be at an interior
    /// index and the port must lex as an integer in `1..=65535`.
    pub fn parse(token: &str) -> Result<HostPort, TxServerError> {
        let bad = || TxServerError::HostPortParameter(token.to_string());

        let col = token.find(':').ok_or_else(bad)?;
        if col == 0 || col >= token.len() - 1 {
            return Err(bad());
        }

        let port: u32 = token[col + 1..].parse().map_err(|_| bad())?;
        if !(1..=u16::MAX as u32).contains(&port) {
            return Err(bad());
        }

        Ok(HostPort {
            host: token[..col].to_string(),
            port: port as u16,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split a comma-separated `host:port` list into per-token parse results,
/// so the caller can count valid entries and report the invalid ones.
pub fn parse_host_list(hosts: &str) -> Vec<Result<HostPort, TxServerError>> {
    hosts.split(',').map(HostPort::parse).collect()
}
