mod common;

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{certificates, envelope, fixture, harness, signing_key};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use trisa_node::{NodeConfig, NodeError, Server};
use trisa_protocol::codec::{read_frame, write_frame};
use trisa_protocol::{
    Address, Call, ErrorCode, HealthCheck, Reply, ServingStatus, StreamFrame, StreamReply,
    StreamStatus,
};

fn config(bind_addr: &str) -> NodeConfig {
    NodeConfig {
        bind_addr: bind_addr.to_string(),
        server_certs: fixture("server-bundle.pem"),
        server_cert_pool: fixture("ca.pem"),
        ..NodeConfig::default()
    }
}

fn test_server() -> Arc<Server> {
    let harness = harness();
    Arc::new(Server::with_service(config("127.0.0.1:0"), common::identity(), harness.service))
}

fn client_config(bundle: &str) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in certificates("ca.pem") {
        roots.add(cert).expect("add root");
    }
    let mut reader = BufReader::new(File::open(fixture(bundle)).expect("open bundle"));
    let key = rustls_pemfile::private_key(&mut reader).expect("read key").expect("key present");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certificates(bundle), key)
        .expect("client config");
    Arc::new(config)
}

async fn connect(addr: SocketAddr, bundle: &str) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").expect("server name");
    TlsConnector::from(client_config(bundle)).connect(name, tcp).await
}

async fn call(conn: &mut TlsStream<TcpStream>, call: Call) -> Reply {
    write_frame(conn, &call).await.expect("write call");
    read_frame::<Reply, _>(conn).await.expect("read reply").expect("reply")
}

#[tokio::test]
async fn unary_calls_over_mutual_tls() {
    let server = test_server();
    let addr = server.start().await.expect("start");
    let mut conn = connect(addr, "client-bundle.pem").await.expect("connect");

    match call(&mut conn, Call::Status(HealthCheck::default())).await {
        Reply::ServiceState(state) => assert_eq!(state.status, ServingStatus::Healthy),
        other => panic!("unexpected reply {:?}", other),
    }

    match call(&mut conn, Call::Transfer(envelope("u1"))).await {
        Reply::Failed(err) => {
            assert_eq!(err.code, ErrorCode::NoSigningKey);
            assert!(err.is_retryable());
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match call(&mut conn, Call::KeyExchange(signing_key("peer-rsa-a.der"))).await {
        Reply::SigningKey(key) => assert_eq!(key.public_key_algorithm, "RSA"),
        other => panic!("unexpected reply {:?}", other),
    }

    match call(&mut conn, Call::Transfer(envelope("u2"))).await {
        Reply::Envelope(env) => assert_eq!(env.id, "u2"),
        other => panic!("unexpected reply {:?}", other),
    }

    let address = Address { address: "bc1qexample".into(), network: "BTC".into() };
    match call(&mut conn, Call::ConfirmAddress(address)).await {
        Reply::Failed(err) => assert_eq!(err.code, ErrorCode::Unimplemented),
        other => panic!("unexpected reply {:?}", other),
    }

    drop(conn);
    assert!(server.shutdown().await);
    server.wait().await.expect("clean stop");
}

#[tokio::test]
async fn transfer_stream_over_mutual_tls() {
    let server = test_server();
    let addr = server.start().await.expect("start");

    let mut conn = connect(addr, "client-bundle.pem").await.expect("connect");
    call(&mut conn, Call::KeyExchange(signing_key("peer-rsa-a.der"))).await;

    write_frame(&mut conn, &Call::OpenStream).await.expect("open stream");
    for id in ["t1", "t2"] {
        write_frame(&mut conn, &StreamFrame::Envelope(envelope(id))).await.expect("send");
        match read_frame::<StreamReply, _>(&mut conn).await.expect("read") {
            Some(StreamReply::Envelope(env)) => assert_eq!(env.id, id),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    write_frame(&mut conn, &StreamFrame::CloseSend).await.expect("close send");
    let closed = read_frame::<StreamReply, _>(&mut conn).await.expect("read status");
    assert_eq!(closed, Some(StreamReply::Closed(StreamStatus::Ok { messages: 2 })));

    assert!(server.shutdown().await);
}

#[tokio::test]
async fn stream_before_key_exchange_is_rejected() {
    let server = test_server();
    let addr = server.start().await.expect("start");
    let mut conn = connect(addr, "client-bundle.pem").await.expect("connect");

    write_frame(&mut conn, &Call::OpenStream).await.expect("open stream");
    match read_frame::<StreamReply, _>(&mut conn).await.expect("read") {
        Some(StreamReply::Closed(StreamStatus::Rejected(err))) => {
            assert_eq!(err.code, ErrorCode::NoSigningKey);
            assert!(err.is_retryable());
        }
        other => panic!("unexpected frame {:?}", other),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn client_from_foreign_issuer_is_refused() {
    let server = test_server();
    let addr = server.start().await.expect("start");

    let outcome = async {
        let mut conn = connect(addr, "rogue-bundle.pem").await?;
        write_frame(&mut conn, &Call::Status(HealthCheck::default())).await?;
        read_frame::<Reply, _>(&mut conn).await
    }
    .await;
    assert!(!matches!(outcome, Ok(Some(_))), "rogue client got a reply: {:?}", outcome);
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_shutdown_runs_once() {
    let server = test_server();
    server.start().await.expect("start");

    let (first, second) = tokio::join!(server.shutdown(), server.shutdown());
    assert!(first ^ second, "exactly one shutdown should win: {} {}", first, second);
    assert!(!server.shutdown().await);
    server.wait().await.expect("clean stop");
}

#[tokio::test]
async fn bind_failure_is_reported_immediately() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = occupied.local_addr().expect("addr");
    let harness = harness();
    let server =
        Server::with_service(config(&addr.to_string()), common::identity(), harness.service);

    let err = server.start().await.expect_err("address in use");
    assert!(matches!(err, NodeError::Bind { .. }), "got {}", err);
}

#[tokio::test]
async fn start_can_retry_after_bind_failure() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = occupied.local_addr().expect("addr");
    let harness = harness();
    let server =
        Server::with_service(config(&addr.to_string()), common::identity(), harness.service);

    assert!(matches!(server.start().await, Err(NodeError::Bind { .. })));
    drop(occupied);
    let bound = server.start().await.expect("second attempt binds");
    assert_eq!(bound, addr);
    assert!(server.shutdown().await);
}

#[tokio::test]
async fn shutdown_does_not_wait_for_unfinished_handshake() {
    let server = test_server();
    let addr = server.start().await.expect("start");
    let _silent = TcpStream::connect(addr).await.expect("tcp connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown completes while a client sits before its ClientHello");
    assert!(stopped);
    server.wait().await.expect("clean stop");
}

#[tokio::test]
async fn second_start_is_refused() {
    let server = test_server();
    server.start().await.expect("start");
    assert!(matches!(server.start().await, Err(NodeError::AlreadyStarted)));
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_stream() {
    let server = test_server();
    let addr = server.start().await.expect("start");
    let mut conn = connect(addr, "client-bundle.pem").await.expect("connect");
    call(&mut conn, Call::KeyExchange(signing_key("peer-rsa-a.der"))).await;

    write_frame(&mut conn, &Call::OpenStream).await.expect("open stream");
    write_frame(&mut conn, &StreamFrame::Envelope(envelope("d1"))).await.expect("send");
    assert!(matches!(
        read_frame::<StreamReply, _>(&mut conn).await.expect("read"),
        Some(StreamReply::Envelope(_))
    ));

    let stopping = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished(), "shutdown must wait for the open stream");

    write_frame(&mut conn, &StreamFrame::Envelope(envelope("d2"))).await.expect("send");
    assert!(matches!(
        read_frame::<StreamReply, _>(&mut conn).await.expect("read"),
        Some(StreamReply::Envelope(_))
    ));
    write_frame(&mut conn, &StreamFrame::CloseSend).await.expect("close send");
    assert_eq!(
        read_frame::<StreamReply, _>(&mut conn).await.expect("status"),
        Some(StreamReply::Closed(StreamStatus::Ok { messages: 2 }))
    );

    assert!(stopping.await.expect("join"));
}

#[tokio::test]
async fn abort_cancels_in_flight_stream() {
    let server = test_server();
    let addr = server.start().await.expect("start");
    let mut conn = connect(addr, "client-bundle.pem").await.expect("connect");
    call(&mut conn, Call::KeyExchange(signing_key("peer-rsa-a.der"))).await;

    write_frame(&mut conn, &Call::OpenStream).await.expect("open stream");
    write_frame(&mut conn, &StreamFrame::Envelope(envelope("a1"))).await.expect("send");
    read_frame::<StreamReply, _>(&mut conn).await.expect("read");

    server.abort();
    assert_eq!(
        read_frame::<StreamReply, _>(&mut conn).await.expect("status"),
        Some(StreamReply::Closed(StreamStatus::Cancelled))
    );
    assert!(server.shutdown().await);
}
