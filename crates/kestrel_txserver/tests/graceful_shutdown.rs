//! Graceful teardown: in-flight requests unblock, goodbyes go out, every
//! handler lands back in IDLE and no background thread outlives the pool.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use common::{init_tracing, test_config, wait_until, FakePageServer};
use kestrel_txserver::messages::TranToPageRequest;
use kestrel_txserver::{ConnState, TransactionServer};

#[test]
fn test_disconnect_all_unblocks_inflight_round_trips() {
    init_tracing();
    let ps1 = FakePageServer::start();
    let ps2 = FakePageServer::start();
    let server = Arc::new(TransactionServer::new(test_config(&[&ps1, &ps2])));
    server.boot("testdb").unwrap();

    // Stall the servers so round trips hang in flight.
    ps1.set_respond(false);
    ps2.set_respond(false);

    let mut inflight = Vec::new();
    for _ in 0..2 {
        let server = Arc::clone(&server);
        inflight.push(thread::spawn(move || {
            server.send_receive(TranToPageRequest::GetBootInfo, Bytes::new())
        }));
    }
    thread::sleep(Duration::from_millis(100));
    for call in &inflight {
        assert!(!call.is_finished(), "round trip should be blocked");
    }

    server.disconnect_all_page_servers();

    for call in inflight {
        let result = call.join().unwrap();
        assert!(result.is_err(), "in-flight call must fail, not hang");
    }

    for snapshot in server.handler_snapshots() {
        assert_eq!(snapshot.state, ConnState::Idle);
    }
    assert!(server.get_main_connection_info().is_none());

    server.shutdown();
}

#[test]
fn test_disconnect_all_sends_goodbye() {
    init_tracing();
    let ps = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps]));
    server.boot("testdb").unwrap();

    server.disconnect_all_page_servers();

    assert!(ps
        .wait_for_request(TranToPageRequest::SendDisconnectMsg, Duration::from_secs(2))
        .is_some());
    assert!(wait_until(Duration::from_secs(2), || {
        ps.connection_count() == 0
    }));

    server.shutdown();
}

#[test]
fn test_page_server_initiated_disconnect() {
    init_tracing();
    let ps = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps]));
    server.boot("testdb").unwrap();

    // The page server asks us to go away; the handler winds down and
    // answers with a goodbye.
    ps.request_disconnect();

    assert!(ps
        .wait_for_request(TranToPageRequest::SendDisconnectMsg, Duration::from_secs(2))
        .is_some());
    // The handler lands in IDLE and the reconnector then brings the
    // connection back, proving the full disconnect/reconnect cycle.
    assert!(wait_until(Duration::from_secs(5), || {
        server.handler_snapshots()[0].state == ConnState::Connected
            && ps.connection_count() >= 1
    }));

    server.shutdown();
}

#[test]
fn test_shutdown_is_idempotent() {
    init_tracing();
    let ps = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps]));
    server.boot("testdb").unwrap();

    server.shutdown();
    server.shutdown();
    assert!(!server.is_page_server_connected());
}
