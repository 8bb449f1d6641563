//! Catch-up initiation and prior-list fan-out.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{init_tracing, test_config, wait_until, FakePageServer};
use kestrel_common::types::Lsa;
use kestrel_txserver::messages::{decode_start_catch_up, TranToPageRequest};
use kestrel_txserver::{ConnState, TransactionServer};

#[test]
fn test_boot_catch_up_carries_null_position() {
    init_tracing();
    let ps = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps]));
    server.boot("testdb").unwrap();

    // At boot the log subsystem is not initialized yet, so the catch-up
    // request carries the sentinel endpoint and the null LSA.
    let payload = ps
        .wait_for_request(TranToPageRequest::SendStartCatchUp, Duration::from_secs(2))
        .expect("catch-up request should arrive");
    let (host, port, lsa) = decode_start_catch_up(&payload).unwrap();
    assert_eq!(host, "N/A");
    assert_eq!(port, -1);
    assert!(lsa.is_null());

    server.shutdown();
}

#[test]
fn test_prior_emissions_fan_out_to_every_connection() {
    init_tracing();
    let ps1 = FakePageServer::start();
    let ps2 = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps1, &ps2]));
    server.boot("testdb").unwrap();

    server
        .log_context()
        .prior_sender()
        .send(&Bytes::from_static(b"chunk-1"));
    server
        .log_context()
        .prior_sender()
        .send(&Bytes::from_static(b"chunk-2"));

    for ps in [&ps1, &ps2] {
        assert!(wait_until(Duration::from_secs(2), || {
            ps.received_requests()
                .iter()
                .filter(|r| r.code == TranToPageRequest::SendLogPriorList.code())
                .count()
                == 2
        }));
        let chunks: Vec<_> = ps
            .received_requests()
            .into_iter()
            .filter(|r| r.code == TranToPageRequest::SendLogPriorList.code())
            .map(|r| r.payload)
            .collect();
        assert_eq!(chunks, vec![b"chunk-1".to_vec(), b"chunk-2".to_vec()]);
    }

    server.shutdown();
}

#[test]
fn test_late_joiner_catches_up_from_main_connection() {
    init_tracing();
    let ps1 = FakePageServer::start();
    let ps2 = FakePageServer::start();
    let server = TransactionServer::new(test_config(&[&ps1, &ps2]));
    server.boot("testdb").unwrap();

    // The log subsystem comes up and starts streaming.
    server
        .log_context()
        .prior_sender()
        .set_unsent_lsa(Lsa::new(3, 120));

    // ps2 drops out and rejoins: the reconnector reopens the channel, and
    // this time the catch-up request names the main connection (ps1) as
    // the source and the live stream position. Catch-up stays pending
    // until the test completes it.
    ps2.set_auto_catchup(false);
    ps2.kill_connections();

    let catchup_requests = || {
        ps2.received_requests()
            .into_iter()
            .filter(|r| r.code == TranToPageRequest::SendStartCatchUp.code())
            .collect::<Vec<_>>()
    };
    assert!(wait_until(Duration::from_secs(5), || {
        catchup_requests().len() >= 2
    }));
    let payload = catchup_requests().pop().unwrap().payload;
    let (host, port, lsa) = decode_start_catch_up(&payload).unwrap();
    assert_eq!(format!("{host}:{port}"), ps1.host_port());
    assert_eq!(lsa, Lsa::new(3, 120));

    // While catching up the handler is not yet live, but the prior stream
    // already reaches it.
    let snapshot = &server.handler_snapshots()[1];
    assert_eq!(snapshot.state, ConnState::Connecting);
    server
        .log_context()
        .prior_sender()
        .send(&Bytes::from_static(b"live-chunk"));
    assert!(wait_until(Duration::from_secs(2), || {
        ps2.received_requests()
            .iter()
            .any(|r| r.code == TranToPageRequest::SendLogPriorList.code())
    }));

    // Catch-up completion is what makes it live.
    ps2.send_catchup_complete();
    assert!(wait_until(Duration::from_secs(2), || {
        server.handler_snapshots()[1].state == ConnState::Connected
    }));

    server.shutdown();
}
