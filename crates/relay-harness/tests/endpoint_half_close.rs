//! Endpoint behaviour over real loopback connections.
//!
//! These tests connect two endpoints directly, without a relay in between,
//! so every verdict is about the endpoints and the ledgers themselves.

use relay_harness::{
    ByteLedger, Consumed, Endpoint, Flows, HarnessError, Mode, Shutdown, Verdict, Violation,
    check_transfer, verify,
};
use tokio::io::AsyncWriteExt;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

/// A listening endpoint on an ephemeral port and a client connected to it.
async fn connected_pair() -> (Endpoint, Endpoint) {
    let mut server = Endpoint::listen(0).await.unwrap();
    let port = server.local_port().unwrap();
    let client = Endpoint::connect(port).await.unwrap();
    server.accept().await.unwrap();
    (client, server)
}

#[tokio::test]
async fn alternating_messages_arrive_exactly() {
    init_tracing();
    let (mut a, mut b) = connected_pair().await;

    for round in 0..3 {
        let ping = format!("ping {}\n", round);
        a.send(ping.clone()).await.unwrap();
        assert_eq!(b.consume(ping.len()).await.unwrap(), Consumed::Complete);

        let pong = format!("pong {}\n", round);
        b.send(pong.clone()).await.unwrap();
        assert_eq!(a.consume(pong.len()).await.unwrap(), Consumed::Complete);
    }

    assert!(check_transfer(&a, &b).is_exact());
    assert!(check_transfer(&b, &a).is_exact());
    assert_eq!(a.sent().chunks().len(), 3);
}

#[tokio::test]
async fn write_shutdown_blocks_sends_but_not_reads() {
    init_tracing();
    let (mut a, mut b) = connected_pair().await;

    a.send(&b"hello\n"[..]).await.unwrap();
    a.shutdown(Shutdown::Write).unwrap();
    assert_eq!(a.open_flows(), Flows::READ);

    let err = a.send(&b"more"[..]).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::ProtocolViolation(Violation::ClosedWriteSide)
    ));
    assert_eq!(a.sent().len(), 6);

    // The receiver gets everything, then sees the peer close.
    assert_eq!(
        b.consume(100).await.unwrap(),
        Consumed::PeerClosed { received: 6 }
    );
    assert_eq!(b.received().concat().as_ref(), b"hello\n");

    // The other direction still works.
    b.send(&b"bye\n"[..]).await.unwrap();
    assert_eq!(a.consume(4).await.unwrap(), Consumed::Complete);

    b.shutdown(Shutdown::Write).unwrap();
    assert_eq!(
        a.consume(1).await.unwrap(),
        Consumed::PeerClosed { received: 0 }
    );
    assert!(check_transfer(&b, &a).is_exact());
}

#[tokio::test]
async fn closing_a_closed_flow_is_a_violation() {
    init_tracing();
    let (mut a, _b) = connected_pair().await;

    a.shutdown(Shutdown::Write).unwrap();
    assert!(matches!(
        a.shutdown(Shutdown::Write),
        Err(HarnessError::ProtocolViolation(Violation::FlowAlreadyClosed(
            relay_harness::Flow::Write
        )))
    ));
    assert!(!a.is_closed());

    // Both only touches what is still open, then closes the socket.
    a.shutdown(Shutdown::Both).unwrap();
    assert!(a.is_closed());
    assert!(a.open_flows().is_empty());

    assert!(matches!(
        a.shutdown(Shutdown::Read),
        Err(HarnessError::ProtocolViolation(Violation::SocketClosed))
    ));
    assert!(matches!(
        a.consume(1).await,
        Err(HarnessError::ProtocolViolation(Violation::SocketClosed))
    ));
}

#[tokio::test]
async fn last_single_flow_closes_the_socket() {
    let (mut a, _b) = connected_pair().await;

    a.shutdown(Shutdown::Read).unwrap();
    assert!(matches!(
        a.consume(1).await,
        Err(HarnessError::ProtocolViolation(Violation::ClosedReadSide))
    ));
    assert!(!a.is_closed());

    a.shutdown(Shutdown::Write).unwrap();
    assert!(a.is_closed());
}

#[tokio::test]
async fn receiver_that_stops_early_holds_a_prefix() {
    init_tracing();
    let (mut a, mut b) = connected_pair().await;

    let chunk = vec![b'X'; 1024];
    for _ in 0..8 {
        a.send(chunk.clone()).await.unwrap();
    }
    b.consume(5 * 1024).await.unwrap();
    a.shutdown(Shutdown::Both).unwrap();

    let verdict = check_transfer(&a, &b);
    assert!(verdict.is_prefix());
    assert_eq!(
        verdict,
        Verdict::Truncated {
            transferred: 5 * 1024,
            lost: 3 * 1024
        }
    );
}

#[tokio::test]
async fn reading_to_the_end_catches_extra_bytes() {
    init_tracing();
    let mut b = Endpoint::listen(0).await.unwrap();
    let port = b.local_port().unwrap();

    // A misbehaving forwarder: says hello twice where it was asked once.
    let mut forwarder = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    b.accept().await.unwrap();
    forwarder.write_all(b"hello\nhello\n").await.unwrap();
    forwarder.shutdown().await.unwrap();

    let expected: ByteLedger = std::iter::once(&b"hello\n"[..]).collect();
    assert_eq!(b.consume(6).await.unwrap(), Consumed::Complete);
    assert!(verify(&expected, b.received()).is_exact());

    assert_eq!(b.consume_to_end().await.unwrap(), 6);
    assert_eq!(
        verify(&expected, b.received()),
        Verdict::UnexpectedExtra { excess: 6 }
    );
    assert_eq!(b.consume_to_end().await.unwrap(), 0);
}

#[tokio::test]
async fn reading_to_the_end_after_read_shutdown_is_a_violation() {
    let (mut a, mut b) = connected_pair().await;
    a.send(&b"x"[..]).await.unwrap();
    b.shutdown(Shutdown::Read).unwrap();

    assert!(matches!(
        b.consume_to_end().await,
        Err(HarnessError::ProtocolViolation(Violation::ClosedReadSide))
    ));
}

#[tokio::test]
async fn sockets_are_configured_on_both_sides() {
    let mut server = Endpoint::new(Mode::Listen(0), 4096).await.unwrap();
    let port = server.local_port().unwrap();
    let client = Endpoint::new(Mode::Connect(port), 4096).await.unwrap();
    server.accept().await.unwrap();

    // The kernel may round the request up, never below it.
    assert!(server.recv_buffer_size().unwrap() >= 4096);
    assert!(client.recv_buffer_size().unwrap() >= 4096);
    assert_eq!(server.requested_rcv_buf(), 4096);
    assert_eq!(server.mode(), Mode::Listen(0));
}

#[tokio::test]
async fn accept_twice_is_rejected() {
    let (_a, mut b) = connected_pair().await;
    assert!(matches!(b.accept().await, Err(HarnessError::NotListening)));
}
