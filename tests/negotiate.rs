use matrix_driver::negotiate::TcpConfig;
use matrix_driver::{ConnectionTarget, Error, Negotiator, NegotiatorConfig, TransportType};
use tokio::io::AsyncReadExt as _;

mod common;

fn insecure() -> Negotiator {
    Negotiator::new(NegotiatorConfig::default().with_insecure_skip_verify(true)).unwrap()
}

fn local(port: u16) -> ConnectionTarget {
    ConnectionTarget::new(Some("127.0.0.1"), Some(port), "alice")
}

/// Read whatever the client sends until it closes.
async fn drain(mut stream: common::ServerStream) -> std::io::Result<Vec<u8>> {
    let mut received = Vec::new();
    let _ = stream.read_to_end(&mut received).await;
    Ok(received)
}

#[tokio::test]
async fn selects_http2() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"h2", b"http/1.1"]), drain).await;

    let stream = insecure().negotiate(&local(port)).await.unwrap();
    assert_eq!(stream.transport(), TransportType::Http2);
    assert_eq!(stream.tls_info().mechanism, Some("alpn"));
    assert_eq!(stream.tls_info().protocol_name().as_deref(), Some("h2"));
    assert!(!stream.tls_info().validated_server_name);

    drop(stream);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn selects_http1() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"http/1.1"]), drain).await;

    let stream = insecure().negotiate(&local(port)).await.unwrap();
    assert_eq!(stream.transport(), TransportType::Http1);

    drop(stream);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn no_protocol_selected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[]), drain).await;

    let err = insecure().negotiate(&local(port)).await.unwrap_err();
    assert!(
        matches!(err, Error::UnsupportedTransport { protocol: None }),
        "{err:?}"
    );

    let received = server.await.unwrap().unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn unknown_protocol_selected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"spdy/1"]), drain).await;

    // rustls servers reject clients with no protocol in common, so the
    // client has to offer spdy/1 for the server to pick it.
    let negotiator = Negotiator::new(
        NegotiatorConfig::default()
            .with_insecure_skip_verify(true)
            .with_protocols(["h2", "http/1.1", "spdy/1"]),
    )
    .unwrap();

    let err = negotiator.negotiate(&local(port)).await.unwrap_err();
    match &err {
        Error::UnsupportedTransport { protocol } => {
            assert_eq!(protocol.as_deref(), Some("spdy/1"))
        }
        _ => panic!("expected unsupported transport, got {err:?}"),
    }
    assert_eq!(err.to_string(), "unsupported transport: spdy/1");

    let received = server.await.unwrap().unwrap();
    assert!(received.is_empty(), "server received application bytes");
}

#[tokio::test]
async fn connection_refused() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = common::closed_port().await;
    let err = insecure().negotiate(&local(port)).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err:?}");
    assert!(err.is_connect());
}

#[tokio::test]
async fn strict_rejects_self_signed() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"h2"]), drain).await;

    let negotiator = Negotiator::new(NegotiatorConfig::default()).unwrap();
    let target = ConnectionTarget::new(Some("localhost"), Some(port), "alice");
    let err = negotiator.negotiate(&target).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err:?}");

    // The server sees the handshake fail.
    assert!(server.await.unwrap().is_err());
}

#[tokio::test]
async fn connect_timeout_config() {
    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"h2"]), drain).await;

    let mut tcp = TcpConfig::default();
    tcp.connect_timeout = Some(std::time::Duration::from_secs(5));
    let negotiator = Negotiator::new(
        NegotiatorConfig::default()
            .with_insecure_skip_verify(true)
            .with_tcp(tcp),
    )
    .unwrap();

    let stream = negotiator.negotiate(&local(port)).await.unwrap();
    assert_eq!(stream.transport(), TransportType::Http2);
    drop(stream);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn negotiator_as_service() {
    use tower::ServiceExt as _;

    let _ = tracing_subscriber::fmt::try_init();

    let (port, server) = common::serve(common::server_config(&[b"http/1.1"]), drain).await;

    let stream = insecure().oneshot(local(port)).await.unwrap();
    assert_eq!(stream.transport(), TransportType::Http1);
    drop(stream);
    server.await.unwrap().unwrap();
}
