//! TCP connection setup for the negotiator.
//!
//! Resolves the host with the system resolver and tries each address in
//! turn. Socket options are applied through `socket2` before connecting.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// The timeout for connecting to a single remote address.
    ///
    /// `None` waits for the operating system to give up.
    pub connect_timeout: Option<Duration>,

    /// The idle time before TCP keep-alive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
        }
    }
}

/// Connect to a host and port, trying each resolved address in order.
pub(crate) async fn connect(host: &str, port: u16, config: &TcpConfig) -> io::Result<TcpStream> {
    let addrs = tokio::net::lookup_host((host, port)).await?;

    let mut last_error = None;
    for addr in addrs {
        let span = tracing::trace_span!("tcp", remote.addr = %addr);
        match connect_addr(addr, config).instrument(span).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                trace!(remote.addr = %addr, %error, "tcp connect attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, config: &TcpConfig) -> io::Result<TcpStream> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    trace!("tcp socket opened");

    // When constructing a Tokio `TcpSocket` from a std socket, the caller is
    // responsible for ensuring O_NONBLOCK is set.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    let socket = TcpSocket::from_std_stream(socket.into());
    let connect = socket.connect(addr);

    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result?,
            Err(elapsed) => {
                trace!(timeout = ?dur, "connection timed out");
                return Err(io::Error::new(io::ErrorKind::TimedOut, elapsed));
            }
        },
        None => connect.await?,
    };

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    trace!("tcp connected");
    Ok(stream)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_tcp_connect() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        let (stream, _) = tokio::join!(
            async {
                connect("127.0.0.1", port, &TcpConfig::default())
                    .await
                    .unwrap()
            },
            async { bind.accept().await.unwrap().0 }
        );

        assert_eq!(
            stream.peer_addr().unwrap(),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
        );
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();
        drop(bind);

        let config = TcpConfig {
            connect_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        let err = connect("127.0.0.1", port, &config).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
