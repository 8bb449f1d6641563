//! Wire messages between the transaction server and its page servers, and
//! their payload codecs.
//!
//! All integers are little-endian fixed-width; every decoder validates the
//! payload length before touching it. A size mismatch means a protocol bug
//! on one side, so decoders also `debug_assert!` the expected length.

use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::error::ChannelError;
use kestrel_common::types::{Lsa, MvccId};

/// Requests the transaction server sends to a page server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TranToPageRequest {
    GetBootInfo = 0,
    GetOldestActiveMvccid = 1,
    SendLogPriorList = 2,
    SendStartCatchUp = 3,
    SendDisconnectMsg = 4,
    Respond = 5,
}

impl TranToPageRequest {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Requests a page server sends to the transaction server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PageToTranRequest {
    SendSavedLsa = 0,
    SendCatchupComplete = 1,
    SendDisconnectRequestMsg = 2,
    Respond = 3,
}

impl PageToTranRequest {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::SendSavedLsa),
            1 => Some(Self::SendCatchupComplete),
            2 => Some(Self::SendDisconnectRequestMsg),
            3 => Some(Self::Respond),
            _ => None,
        }
    }
}

/// Identity a server presents in the post-connect handshake. The peer must
/// echo the same value back or the connect is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ConnectionType {
    ActiveTransactionServer = 0,
    PassiveTransactionServer = 1,
}

impl ConnectionType {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

fn length_error(what: &str, expected: usize, got: usize) -> ChannelError {
    debug_assert!(false, "{what}: expected {expected} bytes, got {got}");
    ChannelError::MalformedFrame(format!("{what}: expected {expected} bytes, got {got}"))
}

// ---------------------------------------------------------------------------
// LSA
// ---------------------------------------------------------------------------

pub fn encode_lsa(lsa: Lsa) -> Bytes {
    let mut buf = BytesMut::with_capacity(Lsa::WIRE_SIZE);
    put_lsa(&mut buf, lsa);
    buf.freeze()
}

pub fn decode_lsa(payload: &[u8]) -> Result<Lsa, ChannelError> {
    if payload.len() != Lsa::WIRE_SIZE {
        return Err(length_error("saved LSA", Lsa::WIRE_SIZE, payload.len()));
    }
    Ok(get_lsa(payload))
}

fn put_lsa(buf: &mut BytesMut, lsa: Lsa) {
    buf.put_u32_le(lsa.page_id);
    buf.put_u32_le(lsa.offset);
}

fn get_lsa(bytes: &[u8]) -> Lsa {
    let page_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    Lsa::new(page_id, offset)
}

// ---------------------------------------------------------------------------
// MVCCID
// ---------------------------------------------------------------------------

pub fn encode_mvccid(id: MvccId) -> Bytes {
    Bytes::copy_from_slice(&id.0.to_le_bytes())
}

pub fn decode_mvccid(payload: &[u8]) -> Result<MvccId, ChannelError> {
    if payload.len() != MvccId::WIRE_SIZE {
        return Err(length_error("MVCCID", MvccId::WIRE_SIZE, payload.len()));
    }
    Ok(MvccId(u64::from_le_bytes(payload.try_into().unwrap())))
}

// ---------------------------------------------------------------------------
// Boot info
// ---------------------------------------------------------------------------

/// The boot-info reply carries the permanent-volume count as a bare LE u16.
pub fn encode_volume_count(count: u16) -> Bytes {
    Bytes::copy_from_slice(&count.to_le_bytes())
}

pub fn decode_volume_count(payload: &[u8]) -> Result<u16, ChannelError> {
    if payload.len() != 2 {
        return Err(length_error("volume count", 2, payload.len()));
    }
    Ok(u16::from_le_bytes(payload.try_into().unwrap()))
}

// ---------------------------------------------------------------------------
// Connection type (handshake echo and disconnect payload)
// ---------------------------------------------------------------------------

pub fn encode_connection_type(conn_type: ConnectionType) -> Bytes {
    Bytes::copy_from_slice(&conn_type.code().to_le_bytes())
}

// ---------------------------------------------------------------------------
// Start catch-up
// ---------------------------------------------------------------------------

/// Where a freshly connected page server should source its catch-up from:
/// a length-prefixed host string, an i32 port and the catch-up LSA. The
/// port is −1 and the LSA null while the log subsystem is not yet
/// initialized.
pub fn encode_start_catch_up(host: &str, port: i32, catchup_lsa: Lsa) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + host.len() + 4 + Lsa::WIRE_SIZE);
    buf.put_u32_le(host.len() as u32);
    buf.put_slice(host.as_bytes());
    buf.put_i32_le(port);
    put_lsa(&mut buf, catchup_lsa);
    buf.freeze()
}

pub fn decode_start_catch_up(payload: &[u8]) -> Result<(String, i32, Lsa), ChannelError> {
    let short =
        || ChannelError::MalformedFrame(format!("start catch-up: short payload ({} bytes)", payload.len()));

    if payload.len() < 4 {
        return Err(short());
    }
    let host_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let rest = &payload[4..];
    if rest.len() != host_len + 4 + Lsa::WIRE_SIZE {
        return Err(short());
    }
    let host = std::str::from_utf8(&rest[..host_len])
        .map_err(|_| ChannelError::MalformedFrame("start catch-up: host is not UTF-8".into()))?
        .to_string();
    let port = i32::from_le_bytes(rest[host_len..host_len + 4].try_into().unwrap());
    let lsa = get_lsa(&rest[host_len + 4..]);
    Ok((host, port, lsa))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_code_roundtrip() {
        for req in [
            PageToTranRequest::SendSavedLsa,
            PageToTranRequest::SendCatchupComplete,
            PageToTranRequest::SendDisconnectRequestMsg,
            PageToTranRequest::Respond,
        ] {
            assert_eq!(PageToTranRequest::from_code(req.code()), Some(req));
        }
        assert_eq!(PageToTranRequest::from_code(99), None);
    }

    #[test]
    fn test_start_catch_up_layout() {
        let encoded = encode_start_catch_up("ps1", 7000, Lsa::new(3, 120));
        // 4 (len) + 3 (host) + 4 (port) + 8 (lsa)
        assert_eq!(encoded.len(), 19);
        let (host, port, lsa) = decode_start_catch_up(&encoded).unwrap();
        assert_eq!(host, "ps1");
        assert_eq!(port, 7000);
        assert_eq!(lsa, Lsa::new(3, 120));
    }

    #[test]
    fn test_start_catch_up_boot_sentinel() {
        let encoded = encode_start_catch_up("N/A", -1, Lsa::NULL);
        let (host, port, lsa) = decode_start_catch_up(&encoded).unwrap();
        assert_eq!(host, "N/A");
        assert_eq!(port, -1);
        assert!(lsa.is_null());
    }

    #[test]
    fn test_decoders_validate_length() {
        assert!(decode_start_catch_up(&[1, 0]).is_err());
        // Length checks are also debug assertions; exercise them only in
        // release test runs.
        if !cfg!(debug_assertions) {
            assert!(decode_lsa(&[0u8; 7]).is_err());
            assert!(decode_mvccid(&[0u8; 9]).is_err());
            assert!(decode_volume_count(&[0u8; 3]).is_err());
        }
    }

    #[test]
    fn test_lsa_wire_roundtrip() {
        let lsa = Lsa::new(0x0102_0304, 0x0a0b_0c0d);
        let encoded = encode_lsa(lsa);
        assert_eq!(encoded.len(), Lsa::WIRE_SIZE);
        assert_eq!(decode_lsa(&encoded).unwrap(), lsa);
    }
}
