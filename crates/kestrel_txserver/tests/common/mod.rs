#![allow(dead_code)] // each test binary uses a different slice of the harness

//! Test harness: a scriptable in-process page server.
//!
//! Speaks the real wire protocol over real TCP sockets: echoes the
//! connection-type handshake, records every request it receives, answers
//! round trips, and lets the test inject saved-LSA reports, catch-up
//! completions and disconnect requests at will.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kestrel_common::types::{Lsa, MvccId, VOLID_MAX};
use kestrel_txserver::messages::{PageToTranRequest, TranToPageRequest};

/// One request frame received from the transaction server.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub code: u32,
    pub payload: Vec<u8>,
}

struct Session {
    writer: Mutex<TcpStream>,
    raw: TcpStream,
}

struct Inner {
    stop: AtomicBool,
    sessions: Mutex<Vec<Arc<Session>>>,
    requests: Mutex<VecDeque<ReceivedRequest>>,
    /// Answer SEND_START_CATCH_UP with an immediate catch-up completion.
    auto_catchup: AtomicBool,
    /// Answer round-trip requests. Cleared to simulate a stalled server.
    respond: AtomicBool,
    oldest_mvccid: AtomicU64,
}

pub struct FakePageServer {
    addr: SocketAddr,
    inner: Arc<Inner>,
    accept_thread: Option<JoinHandle<()>>,
}

impl FakePageServer {
    pub fn start() -> FakePageServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake page server");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().unwrap();

        let inner = Arc::new(Inner {
            stop: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            requests: Mutex::new(VecDeque::new()),
            auto_catchup: AtomicBool::new(true),
            respond: AtomicBool::new(true),
            oldest_mvccid: AtomicU64::new(MvccId::FIRST_NORMAL.0),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_thread = thread::spawn(move || loop {
            if accept_inner.stop.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let session_inner = Arc::clone(&accept_inner);
                    thread::spawn(move || run_session(session_inner, stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => return,
            }
        });

        FakePageServer {
            addr,
            inner,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn host_port(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_auto_catchup(&self, on: bool) {
        self.inner.auto_catchup.store(on, Ordering::SeqCst);
    }

    pub fn set_respond(&self, on: bool) {
        self.inner.respond.store(on, Ordering::SeqCst);
    }

    pub fn set_oldest_mvccid(&self, id: MvccId) {
        self.inner.oldest_mvccid.store(id.0, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// Report a durably flushed position to every connected transaction
    /// server.
    pub fn send_saved_lsa(&self, lsa: Lsa) {
        let payload = kestrel_txserver::messages::encode_lsa(lsa);
        self.broadcast(PageToTranRequest::SendSavedLsa.code(), &payload);
    }

    /// Complete the catch-up of every live session by hand (used with
    /// `set_auto_catchup(false)`).
    pub fn send_catchup_complete(&self) {
        self.broadcast(PageToTranRequest::SendCatchupComplete.code(), &[]);
    }

    /// Ask every connected transaction server to disconnect gracefully.
    pub fn request_disconnect(&self) {
        self.broadcast(PageToTranRequest::SendDisconnectRequestMsg.code(), &[]);
    }

    /// Drop every connection abruptly, as a crashed server would.
    pub fn kill_connections(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock().unwrap());
        for session in sessions {
            let _ = session.raw.shutdown(Shutdown::Both);
        }
    }

    /// All requests received so far, oldest first.
    pub fn received_requests(&self) -> Vec<ReceivedRequest> {
        self.inner.requests.lock().unwrap().iter().cloned().collect()
    }

    /// Wait until a request with `code` has been received and return its
    /// payload.
    pub fn wait_for_request(&self, code: TranToPageRequest, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(req) = self
                .received_requests()
                .into_iter()
                .find(|r| r.code == code.code())
            {
                return Some(req.payload);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Wait until `count` connections are live.
    pub fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.connection_count() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn broadcast(&self, code: u32, payload: &[u8]) {
        let sessions: Vec<_> = self.inner.sessions.lock().unwrap().clone();
        for session in sessions {
            let mut writer = session.writer.lock().unwrap();
            let _ = write_frame(&mut writer, code, 0, payload);
        }
    }

    pub fn stop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.kill_connections();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FakePageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_session(inner: Arc<Inner>, mut stream: TcpStream) {
    // Connection-type echo handshake.
    let mut hello = [0u8; 4];
    if stream.read_exact(&mut hello).is_err() {
        return;
    }
    if stream.write_all(&hello).is_err() {
        return;
    }

    let session = Arc::new(Session {
        writer: Mutex::new(stream.try_clone().expect("clone session stream")),
        raw: stream.try_clone().expect("clone session stream"),
    });
    inner.sessions.lock().unwrap().push(Arc::clone(&session));

    loop {
        let (code, seq, payload) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => break,
        };

        inner.requests.lock().unwrap().push_back(ReceivedRequest {
            code,
            payload: payload.clone(),
        });

        let respond = inner.respond.load(Ordering::SeqCst);
        if code == TranToPageRequest::GetBootInfo.code() && respond {
            let reply = VOLID_MAX.to_le_bytes();
            let mut writer = session.writer.lock().unwrap();
            let _ = write_frame(&mut writer, PageToTranRequest::Respond.code(), seq, &reply);
        } else if code == TranToPageRequest::GetOldestActiveMvccid.code() && respond {
            let reply = inner.oldest_mvccid.load(Ordering::SeqCst).to_le_bytes();
            let mut writer = session.writer.lock().unwrap();
            let _ = write_frame(&mut writer, PageToTranRequest::Respond.code(), seq, &reply);
        } else if code == TranToPageRequest::SendStartCatchUp.code()
            && inner.auto_catchup.load(Ordering::SeqCst)
        {
            let mut writer = session.writer.lock().unwrap();
            let _ = write_frame(
                &mut writer,
                PageToTranRequest::SendCatchupComplete.code(),
                0,
                &[],
            );
        } else if code == TranToPageRequest::SendDisconnectMsg.code() {
            break;
        }
    }

    inner
        .sessions
        .lock()
        .unwrap()
        .retain(|s| !Arc::ptr_eq(s, &session));
}

fn write_frame(
    stream: &mut TcpStream,
    code: u32,
    seq: u64,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(16 + payload.len());
    frame.extend_from_slice(&((12 + payload.len()) as u32).to_le_bytes());
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u32, u64, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < 12 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "short frame",
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    let code = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    let seq = u64::from_le_bytes(frame[4..12].try_into().unwrap());
    Ok((code, seq, frame[12..].to_vec()))
}

/// Fast-paced config pointed at the given fake servers.
pub fn test_config(servers: &[&FakePageServer]) -> kestrel_common::config::TxServerConfig {
    kestrel_common::config::TxServerConfig {
        page_server_hosts: servers
            .iter()
            .map(|s| s.host_port())
            .collect::<Vec<_>>()
            .join(","),
        remote_storage: true,
        log_quorum_consensus: true,
        reconnect_interval_ms: 200,
        boot_conn_timeout_ms: 5_000,
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `predicate` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
