//! Framed TCP channel between the transaction server and one page server.
//!
//! One channel multiplexes three kinds of traffic over a single socket:
//! one-way pushes (log prior lists, disconnect messages), request/response
//! round trips matched by sequence number, and unsolicited inbound requests
//! from the page server dispatched to registered handlers.
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! ┌──────────┬───────────┬──────────┬─────────────┐
//! │ len: u32 │ code: u32 │ seq: u64 │ payload ... │
//! └──────────┴───────────┴──────────┴─────────────┘
//! ```
//!
//! `len` counts everything after itself. A response frame reuses the
//! requester's `seq` with the respond code the channel was built with.
//!
//! Threading: sends happen on the caller's thread under the writer mutex;
//! one named recv worker owns the read side. `stop_incoming()` shuts the
//! read side down and fails every pending round trip, which is how a
//! concurrent disconnect unblocks `send_recv` callers without holding any
//! lock they hold.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::error::ChannelError;

/// Handler for one unsolicited inbound request code.
pub type InboundHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Dispatch table from inbound request codes to handlers.
pub type InboundHandlerMap = HashMap<u32, InboundHandler>;

/// Invoked on a send failure with the error and an out-flag the handler
/// sets when the channel should stop accepting further sends.
pub type SendErrorHandler = Box<dyn Fn(&ChannelError, &mut bool) + Send + Sync>;

/// Invoked once when the read side fails outside a local stop.
pub type RecvErrorHandler = Box<dyn Fn(&ChannelError) + Send>;

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A blocked socket write fails after this long, so a dead peer with a full
/// send buffer cannot wedge a caller that holds locks.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes of the frame after the length field that are not payload.
const FRAME_HEADER_LEN: usize = 4 + 8;

/// Open a socket to `host:port` and run the connection-type echo handshake:
/// send our type as an LE i32, require the peer to echo it back. The
/// timeout bounds both the connect and the handshake reads.
pub fn connect_with_handshake(
    host: &str,
    port: u16,
    conn_type_code: i32,
    timeout: Duration,
) -> Result<TcpStream, ChannelError> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut stream = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let mut stream = match stream {
        Some(s) => s,
        None => {
            return Err(ChannelError::Io(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
            })))
        }
    };

    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;

    stream.write_all(&conn_type_code.to_le_bytes())?;
    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).map_err(ChannelError::from_io)?;
    let echoed = i32::from_le_bytes(echo);
    if echoed != conn_type_code {
        return Err(ChannelError::HandshakeMismatch {
            sent: conn_type_code,
            echoed,
        });
    }

    stream.set_read_timeout(None)?;
    Ok(stream)
}

type PendingMap = HashMap<u64, mpsc::Sender<Result<Bytes, ChannelError>>>;

/// A started channel. See the module docs for the threading model.
pub struct PsChannel {
    peer: String,
    writer: parking_lot::Mutex<TcpStream>,
    /// Separate clone of the socket kept for `shutdown()` calls, which must
    /// not contend with an in-progress write.
    shutdown_handle: TcpStream,
    next_seq: AtomicU64,
    pending: parking_lot::Mutex<PendingMap>,
    /// Set when the read side is down; no new round trips can complete.
    /// One-way pushes stay possible (the goodbye message goes out after the
    /// read side stops).
    stopped: AtomicBool,
    /// Set when the send-error handler asked to abort further processing.
    send_aborted: AtomicBool,
    respond_code: u32,
    on_send_error: SendErrorHandler,
    recv_thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PsChannel {
    /// Wrap a handshaken socket and start the recv worker.
    pub fn start(
        stream: TcpStream,
        peer: String,
        handlers: InboundHandlerMap,
        respond_code: u32,
        on_send_error: SendErrorHandler,
        on_recv_error: RecvErrorHandler,
    ) -> Result<Arc<PsChannel>, ChannelError> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let shutdown_handle = stream.try_clone()?;

        let channel = Arc::new(PsChannel {
            peer: peer.clone(),
            writer: parking_lot::Mutex::new(stream),
            shutdown_handle,
            next_seq: AtomicU64::new(1),
            pending: parking_lot::Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            send_aborted: AtomicBool::new(false),
            respond_code,
            on_send_error,
            recv_thread: parking_lot::Mutex::new(None),
        });

        let weak = Arc::downgrade(&channel);
        let handle = thread::Builder::new()
            .name(format!("kestrel-ps-recv:{peer}"))
            .spawn(move || recv_loop(weak, reader, handlers, on_recv_error))
            .map_err(ChannelError::Io)?;
        *channel.recv_thread.lock() = Some(handle);

        Ok(channel)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// One-way push. On a send failure the send-error handler runs before
    /// the error is returned.
    pub fn push(&self, code: u32, payload: Bytes) -> Result<(), ChannelError> {
        if self.send_aborted.load(Ordering::SeqCst) {
            return Err(ChannelError::Stopped);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.write_frame(code, seq, &payload) {
            self.report_send_error(&e);
            return Err(e);
        }
        Ok(())
    }

    /// One-way push that swallows failures and never invokes the send-error
    /// handler. For the final goodbye of a teardown, which runs under locks
    /// the error handler would need.
    pub fn push_final(&self, code: u32, payload: Bytes) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.write_frame(code, seq, &payload) {
            tracing::debug!(peer = %self.peer, error = %e, "final push failed; peer already gone");
        }
    }

    /// Request/response round trip. Blocks until the matching respond frame
    /// arrives or the channel fails, whichever comes first.
    pub fn send_recv(&self, code: u32, payload: Bytes) -> Result<Bytes, ChannelError> {
        if self.send_aborted.load(Ordering::SeqCst) {
            return Err(ChannelError::Stopped);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.pending.lock();
            // Checked under the pending lock so a concurrent fail-all cannot
            // drain the map between our check and our insert.
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ChannelError::Stopped);
            }
            pending.insert(seq, tx);
        }

        if let Err(e) = self.write_frame(code, seq, &payload) {
            self.pending.lock().remove(&seq);
            self.report_send_error(&e);
            return Err(e);
        }

        match rx.recv() {
            Ok(result) => result,
            // The sender side disappeared with the channel.
            Err(_) => Err(ChannelError::ConnectionClosed),
        }
    }

    /// Stop the read side: shut the socket's read half down, fail every
    /// pending round trip and join the recv worker. The write half stays
    /// usable for a final goodbye push. Must not be called from the recv
    /// worker itself (inbound handlers never call this directly; they go
    /// through the async disconnect path).
    pub fn stop_incoming(&self) {
        let _ = self.shutdown_handle.shutdown(Shutdown::Read);
        self.fail_all_pending();
        let handle = self.recv_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn write_frame(&self, code: u32, seq: u64, payload: &[u8]) -> Result<(), ChannelError> {
        let mut buf = BytesMut::with_capacity(4 + FRAME_HEADER_LEN + payload.len());
        buf.put_u32_le((FRAME_HEADER_LEN + payload.len()) as u32);
        buf.put_u32_le(code);
        buf.put_u64_le(seq);
        buf.put_slice(payload);

        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(&buf) {
            // The frame may be partially on the wire; nothing coherent can
            // be sent after this.
            self.send_aborted.store(true, Ordering::SeqCst);
            return Err(ChannelError::from_io(e));
        }
        Ok(())
    }

    fn report_send_error(&self, err: &ChannelError) {
        tracing::debug!(peer = %self.peer, error = %err, "send failed on page server channel");
        let mut abort_further = false;
        (self.on_send_error)(err, &mut abort_further);
        if abort_further {
            self.send_aborted.store(true, Ordering::SeqCst);
        }
    }

    /// Mark the channel stopped and wake every `send_recv` waiter with a
    /// connection-closed result. Idempotent.
    fn fail_all_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.stopped.store(true, Ordering::SeqCst);
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(ChannelError::ConnectionClosed));
        }
    }

    fn complete_pending(&self, seq: u64, payload: Bytes) {
        let waiter = self.pending.lock().remove(&seq);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(payload));
            }
            None => {
                tracing::warn!(peer = %self.peer, seq, "response for unknown sequence; dropping");
            }
        }
    }
}

impl Drop for PsChannel {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
        if let Some(handle) = self.recv_thread.get_mut().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// The recv worker: read frames, route responses to their waiters and
/// unsolicited requests to the dispatch table. Holds only a weak reference
/// so a dropped channel ends the loop.
fn recv_loop(
    channel: Weak<PsChannel>,
    mut reader: TcpStream,
    handlers: InboundHandlerMap,
    on_recv_error: RecvErrorHandler,
) {
    loop {
        let frame = read_frame(&mut reader);
        let Some(chan) = channel.upgrade() else {
            return;
        };

        match frame {
            Err(err) => {
                if !chan.stopped.load(Ordering::SeqCst) {
                    tracing::debug!(peer = %chan.peer, error = %err, "page server channel read failed");
                    on_recv_error(&err);
                }
                break;
            }
            Ok((code, seq, payload)) => {
                if code == chan.respond_code {
                    chan.complete_pending(seq, payload);
                } else if let Some(handler) = handlers.get(&code) {
                    handler(payload);
                } else {
                    tracing::warn!(peer = %chan.peer, code, "unhandled inbound request code");
                }
            }
        }
    }

    if let Some(chan) = channel.upgrade() {
        chan.fail_all_pending();
    }
}

fn read_frame(reader: &mut TcpStream) -> Result<(u32, u64, Bytes), ChannelError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(ChannelError::from_io)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if !(FRAME_HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(ChannelError::MalformedFrame(format!("frame length {len}")));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).map_err(ChannelError::from_io)?;

    let code = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    let seq = u64::from_le_bytes(frame[4..12].try_into().unwrap());
    let payload = Bytes::copy_from_slice(&frame[FRAME_HEADER_LEN..]);
    Ok((code, seq, payload))
}
