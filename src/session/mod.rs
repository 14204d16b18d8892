//! The session driver.
//!
//! A [`Session`] owns one negotiated connection and one codec, and walks them
//! through connect, login, any number of commands, and disconnect. Each step
//! writes one message and, where a response is expected, reads until the
//! codec reports a complete response. Nothing is written while a response is
//! still outstanding.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::codec::{BindTransport, Codec, Command, Decoded};
use crate::info::TransportType;
use crate::negotiate::NegotiatedStream;
use crate::Error;

mod observer;

pub use self::observer::{Event, Observer, TracingObserver};

/// Default size of each read from the connection.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// The stream is open but nothing has been sent.
    Unconnected,

    /// The connect preamble was sent.
    Connected,

    /// Login completed.
    Authenticated,

    /// At least one command completed.
    CommandSent,

    /// The stream was released.
    Disconnected,
}

impl State {
    /// A short name for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Unconnected => "unconnected",
            State::Connected => "connected",
            State::Authenticated => "authenticated",
            State::CommandSent => "command-sent",
            State::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each individual read. `None` waits forever.
    pub read_timeout: Option<Duration>,

    /// Maximum bytes requested from the stream per read.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Set the per-read deadline.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the read chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Drives one connection through the login and command sequence.
pub struct Session<S, C, O = TracingObserver> {
    stream: Option<S>,
    codec: C,
    transport: TransportType,
    user: String,
    state: State,
    observer: O,
    config: SessionConfig,
    buffer: Vec<u8>,
}

impl<S, C, O> fmt::Debug for Session<S, C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport)
            .field("user", &self.user)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl<S, C, O> Session<S, C, O>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Codec,
    O: Observer,
{
    /// Start a session on a negotiated stream.
    ///
    /// `binder` is bound to the stream's transport to create the codec, and
    /// `user` is the identity presented at login.
    pub fn new<B>(
        stream: NegotiatedStream<S>,
        binder: B,
        user: impl Into<String>,
        observer: O,
    ) -> Self
    where
        B: BindTransport<Codec = C>,
    {
        let (stream, transport) = stream.into_parts();
        Self {
            stream: Some(stream),
            codec: binder.bind(transport),
            transport,
            user: user.into(),
            state: State::Unconnected,
            observer,
            config: SessionConfig::default(),
            buffer: Vec::new(),
        }
    }

    /// Replace the session configuration.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// The transport this session speaks.
    pub fn transport(&self) -> TransportType {
        self.transport
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The user this session logs in as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The codec bound to this session.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The session observer.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Send the connect preamble. No response is awaited.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.require("connect", &[State::Unconnected])?;

        let preamble = self.codec.connect_preamble();
        self.send("connect", &preamble).await?;
        self.transition(State::Connected);
        Ok(())
    }

    /// Log in with `credential` and return the server's response.
    pub async fn login(&mut self, credential: &str) -> Result<C::Response, Error> {
        self.require("login", &[State::Connected])?;

        let request = self
            .codec
            .login_request(&self.user, credential)
            .map_err(Error::codec)?;
        self.send("login", &request).await?;
        let response = self.pump("login").await?;

        self.transition(State::Authenticated);
        Ok(response)
    }

    /// Send an application command and return the server's response.
    pub async fn command(&mut self, command: &Command) -> Result<C::Response, Error> {
        self.require("command", &[State::Authenticated, State::CommandSent])?;

        let step = command.name();
        let request = self.codec.command_request(command).map_err(Error::codec)?;
        self.send(step, &request).await?;
        let response = self.pump(step).await?;

        self.transition(State::CommandSent);
        Ok(response)
    }

    /// Say goodbye and release the connection.
    ///
    /// The codec's disconnect message is sent on a best-effort basis, then the
    /// stream is shut down and dropped. Only a failed shutdown is reported.
    /// Every later call on this session returns [`Error::Disconnected`].
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        let Some(mut stream) = self.stream.take() else {
            return Err(Error::Disconnected);
        };

        if self.state != State::Unconnected {
            let message = self.codec.disconnect_message();
            if !message.is_empty() {
                match write_flush(&mut stream, &message).await {
                    Ok(()) => self.observer.observe(Event::Sent {
                        step: "disconnect",
                        bytes: message.len(),
                    }),
                    Err(error) => self.observer.observe(Event::TeardownFailed {
                        reason: format!("disconnect message: {error}"),
                    }),
                }
            }
        }

        let shutdown = stream.shutdown().await;
        drop(stream);
        self.transition(State::Disconnected);

        if let Err(error) = &shutdown {
            self.observer.observe(Event::TeardownFailed {
                reason: format!("shutdown: {error}"),
            });
        }
        shutdown.map_err(Error::Io)
    }

    /// Tear the session down, then hand back `result`.
    ///
    /// A teardown error replaces a successful `result`, but never hides an
    /// earlier failure.
    pub async fn finish<T>(mut self, result: Result<T, Error>) -> Result<T, Error> {
        let teardown = match self.disconnect().await {
            Err(Error::Disconnected) => Ok(()),
            other => other,
        };

        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(teardown)) => {
                tracing::debug!(%teardown, "teardown also failed");
                Err(error)
            }
        }
    }

    fn require(&self, operation: &'static str, allowed: &[State]) -> Result<(), Error> {
        if self.state == State::Disconnected || self.stream.is_none() {
            return Err(Error::Disconnected);
        }

        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    fn transition(&mut self, to: State) {
        let from = std::mem::replace(&mut self.state, to);
        if from != to {
            self.observer.observe(Event::Transition { from, to });
        }
    }

    async fn send(&mut self, step: &'static str, message: &[u8]) -> Result<(), Error> {
        if message.is_empty() {
            return Ok(());
        }

        let stream = self.stream.as_mut().ok_or(Error::Disconnected)?;
        write_flush(stream, message).await?;
        self.observer.observe(Event::Sent {
            step,
            bytes: message.len(),
        });
        Ok(())
    }

    /// Read and feed the codec until it produces a response.
    async fn pump(&mut self, step: &'static str) -> Result<C::Response, Error> {
        let chunk_size = self.config.chunk_size.max(1);
        if self.buffer.len() != chunk_size {
            self.buffer.resize(chunk_size, 0);
        }

        loop {
            let stream = self.stream.as_mut().ok_or(Error::Disconnected)?;
            let read = stream.read(&mut self.buffer);

            let read = match self.config.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read)
                    .await
                    .map_err(|_| Error::Timeout(timeout))?,
                None => read.await,
            };

            // A TLS peer which drops TCP without close_notify is a closed connection too.
            let n = match read {
                Ok(n) => n,
                Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::trace!(%error, "unclean close from peer");
                    0
                }
                Err(error) => return Err(Error::Io(error)),
            };

            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.observer.observe(Event::Received { bytes: n });

            if let Decoded::Complete(response) =
                self.codec.feed(&self.buffer[..n]).map_err(Error::codec)?
            {
                self.observer.observe(Event::Decoded { step });
                return Ok(response);
            }
        }
    }
}

async fn write_flush<S>(stream: &mut S, message: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(message).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    use crate::codec::matrix::{MatrixClient, MatrixCodec};
    use crate::negotiate::TlsStream;

    assert_impl_all!(Session<TlsStream, MatrixCodec>: Send);

    #[derive(Debug, Default)]
    struct Recorder(Vec<Event>);

    impl Observer for Recorder {
        fn observe(&mut self, event: Event) {
            self.0.push(event);
        }
    }

    fn session(
        stream: tokio::io::DuplexStream,
    ) -> Session<tokio::io::DuplexStream, MatrixCodec, Recorder> {
        Session::new(
            NegotiatedStream::new(stream, TransportType::Http1),
            MatrixClient::new("example.org"),
            "alice",
            Recorder::default(),
        )
    }

    #[test]
    fn default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.read_timeout, None);
    }

    #[tokio::test]
    async fn out_of_order() {
        let (client, _server) = tokio::io::duplex(64);
        let mut session = session(client);

        let err = session.login("hunter2").await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::InvalidState {
                    operation: "login",
                    state: "unconnected"
                }
            ),
            "{err:?}"
        );

        session.connect().await.unwrap();
        assert_eq!(session.state(), State::Connected);

        let err = session.command(&Command::sync()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }), "{err:?}");

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn buffer_follows_config() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut session =
            session(client).with_config(SessionConfig::default().with_chunk_size(16));
        assert!(session.buffer.is_empty());

        let response = "HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n";
        let reply = async {
            let mut request = [0u8; 512];
            let _ = server.read(&mut request).await.unwrap();
            server.write_all(response.as_bytes()).await.unwrap();
        };

        session.connect().await.unwrap();
        let (login, ()) = tokio::join!(session.login("hunter2"), reply);
        assert!(login.unwrap().is_error());
        assert_eq!(session.buffer.len(), 16);
    }

    #[tokio::test]
    async fn read_timeout() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut session = session(client).with_config(
            SessionConfig::default().with_read_timeout(Some(Duration::from_millis(20))),
        );

        session.connect().await.unwrap();
        let err = session.login("hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn disconnect_once() {
        let (client, _server) = tokio::io::duplex(64);
        let mut session = session(client);

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), State::Disconnected);
        assert!(matches!(
            session.disconnect().await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(session.connect().await, Err(Error::Disconnected)));

        assert_eq!(
            session.observer().0,
            vec![Event::Transition {
                from: State::Unconnected,
                to: State::Disconnected
            }]
        );
    }
}
