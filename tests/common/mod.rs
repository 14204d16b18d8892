#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;

pub type ServerStream = TlsStream<TcpStream>;

/// A TLS server configuration with a fresh self-signed certificate for `localhost`.
pub fn server_config(alpn: &[&[u8]]) -> ServerConfig {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();

    let cert = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();

    // Unread tickets would turn the client's close into a reset.
    config.send_tls13_tickets = 0;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

/// Accept one TLS connection on a loopback port and hand it to `handler`.
pub async fn serve<F, Fut, T>(config: ServerConfig, handler: F) -> (u16, JoinHandle<io::Result<T>>)
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        tcp.set_nodelay(true)?;
        let stream = acceptor.accept(tcp).await?;
        tracing::trace!("server accepted tls connection");
        handler(stream).await
    });

    (port, handle)
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// What a [`ScriptedStream`] saw.
#[derive(Debug, Default)]
pub struct StreamLog {
    pub writes: Vec<Vec<u8>>,
    pub reads: usize,
    pub pipelined: bool,
    pub shutdown: bool,
    pub dropped: bool,
}

/// An in-memory stream which answers each write with a scripted reply.
///
/// A reply is made readable only once the write it answers has happened, and
/// is handed out one chunk per read. When nothing is readable the stream
/// reports end of file.
#[derive(Debug)]
pub struct ScriptedStream {
    replies: VecDeque<Vec<Vec<u8>>>,
    pending: VecDeque<Vec<u8>>,
    log: Arc<Mutex<StreamLog>>,
}

impl ScriptedStream {
    pub fn new() -> (Self, Arc<Mutex<StreamLog>>) {
        let log = Arc::new(Mutex::new(StreamLog::default()));
        (
            Self {
                replies: VecDeque::new(),
                pending: VecDeque::new(),
                log: log.clone(),
            },
            log,
        )
    }

    /// Queue the reply to the next unanswered write.
    pub fn reply(mut self, chunks: &[&[u8]]) -> Self {
        self.replies
            .push_back(chunks.iter().map(|c| c.to_vec()).collect());
        self
    }

    /// The next write gets no reply.
    pub fn silent(self) -> Self {
        self.reply(&[])
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.pending.pop_front() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            if n < chunk.len() {
                self.pending.push_front(chunk[n..].to_vec());
            }
            self.log.lock().unwrap().reads += 1;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut log = self.log.lock().unwrap();
        if log.shutdown {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if !self.pending.is_empty() {
            log.pipelined = true;
        }
        log.writes.push(buf.to_vec());
        drop(log);

        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.log.lock().unwrap().shutdown = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.dropped = true;
        }
    }
}

pub mod h2 {
    //! HTTP/2 frames for the fake server side.

    use super::*;

    pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const SETTINGS: u8 = 0x4;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;

    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Frame {
        pub kind: u8,
        pub flags: u8,
        pub stream: u32,
        pub payload: Vec<u8>,
    }

    pub fn frame(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
        let mut head = [0u8; 9];
        reader.read_exact(&mut head).await?;
        let len = (usize::from(head[0]) << 16) | (usize::from(head[1]) << 8) | usize::from(head[2]);
        let mut payload = vec![0; len];
        reader.read_exact(&mut payload).await?;
        Ok(Frame {
            kind: head[3],
            flags: head[4],
            stream: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
            payload,
        })
    }

    /// One request as the server saw it.
    #[derive(Debug, Default)]
    pub struct Received {
        pub stream: u32,
        pub block: Vec<u8>,
        pub body: Vec<u8>,
        pub control: Vec<Frame>,
    }

    /// Read frames until a request stream ends. Connection-level frames are collected in `control`.
    pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Received> {
        let mut received = Received::default();
        loop {
            let frame = read_frame(reader).await?;
            if frame.stream == 0 {
                received.control.push(frame);
                continue;
            }

            received.stream = frame.stream;
            match frame.kind {
                HEADERS => received.block.extend_from_slice(&frame.payload),
                DATA => received.body.extend_from_slice(&frame.payload),
                _ => {}
            }
            if frame.flags & END_STREAM != 0 {
                return Ok(received);
            }
        }
    }
}

pub mod h1 {
    //! HTTP/1.1 requests for the fake server side.

    use super::*;

    /// Read one request, returning its head and body.
    pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(String, Vec<u8>)> {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(reader.read_u8().await?);
        }
        let head = String::from_utf8(head).unwrap();

        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.trim().parse::<usize>().unwrap())
            .unwrap_or(0);

        let mut body = vec![0; length];
        reader.read_exact(&mut body).await?;
        Ok((head, body))
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
