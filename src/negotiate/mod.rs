//! Transport negotiation.
//!
//! The [`Negotiator`] opens a TCP connection, performs the TLS handshake
//! advertising the application protocols we speak, and works out which one
//! the server picked. The result is a [`NegotiatedStream`]: an encrypted
//! stream together with the [`TransportType`] every later message on that
//! connection must use.
//!
//! # Example
//! ```no_run
//! # use matrix_driver::{ConnectionTarget, Negotiator, NegotiatorConfig};
//! # async fn run() -> Result<(), matrix_driver::Error> {
//! let negotiator = Negotiator::new(NegotiatorConfig::default())?;
//! let target = ConnectionTarget::parse("matrix.org", "@alice:matrix.org")?;
//! let stream = negotiator.negotiate(&target).await?;
//! println!("speaking {}", stream.transport());
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tracing::Instrument as _;

use crate::info::{ConnectionTarget, TlsConnectionInfo, TransportType};
use crate::Error;

pub mod strategy;
pub mod tcp;
mod verify;

pub use self::strategy::{Alpn, Negotiation, Npn};
pub use self::tcp::TcpConfig;

/// The encrypted stream produced by a [`Negotiator`].
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Configuration for a [`Negotiator`].
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Skip validation of the server certificate chain and name.
    ///
    /// The driver trusts whatever host the operator points it at when this
    /// is set. Leave it unset to validate against the platform root store.
    pub insecure_skip_verify: bool,

    /// Application protocol identifiers to advertise, in preference order.
    pub protocols: Vec<Vec<u8>>,

    /// Mechanisms used to read back the selected protocol, tried in order.
    pub strategies: Vec<Arc<dyn Negotiation>>,

    /// TCP socket configuration.
    pub tcp: TcpConfig,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            protocols: TransportType::advertised(),
            strategies: strategy::default_strategies(),
            tcp: TcpConfig::default(),
        }
    }
}

impl NegotiatorConfig {
    /// Set whether server certificate validation is skipped.
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Replace the advertised protocol identifiers.
    pub fn with_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the negotiation strategies.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Negotiation>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Set the TCP configuration.
    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    fn tls_config(&self) -> Result<ClientConfig, Error> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|error| Error::Connection(io::Error::other(error)))?;

        let mut config = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verify::SkipServerVerification::new(
                    provider,
                )))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(native_roots())
                .with_no_client_auth()
        };

        config.alpn_protocols = self.protocols.clone();
        Ok(config)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

fn native_roots() -> rustls::RootCertStore {
    let certs = rustls_native_certs::load_native_certs();
    for error in &certs.errors {
        tracing::warn!("could not load platform certificate: {error}");
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.certs);
    tracing::trace!(added, ignored, "loaded platform root certificates");
    roots
}

/// An open, encrypted stream and the transport chosen for it.
#[derive(Debug)]
pub struct NegotiatedStream<S> {
    stream: S,
    transport: TransportType,
    tls: TlsConnectionInfo,
}

impl<S> NegotiatedStream<S> {
    /// Pair a stream with an already-known transport type.
    pub fn new(stream: S, transport: TransportType) -> Self {
        Self {
            stream,
            transport,
            tls: TlsConnectionInfo::default(),
        }
    }

    /// Attach TLS handshake details.
    pub fn with_tls_info(mut self, tls: TlsConnectionInfo) -> Self {
        self.tls = tls;
        self
    }

    /// The transport type selected for this connection.
    pub fn transport(&self) -> TransportType {
        self.transport
    }

    /// Details of the TLS handshake.
    pub fn tls_info(&self) -> &TlsConnectionInfo {
        &self.tls
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Split into the stream and its transport type.
    pub fn into_parts(self) -> (S, TransportType) {
        (self.stream, self.transport)
    }
}

/// Opens TLS connections and selects the application transport for them.
#[derive(Debug, Clone)]
pub struct Negotiator {
    config: Arc<NegotiatorConfig>,
    tls: Arc<ClientConfig>,
}

impl Negotiator {
    /// Create a negotiator, building the TLS configuration from `config`.
    pub fn new(config: NegotiatorConfig) -> Result<Self, Error> {
        let tls = config.tls_config()?;
        Ok(Self {
            config: Arc::new(config),
            tls: Arc::new(tls),
        })
    }

    /// Create a negotiator with a caller-built TLS configuration.
    ///
    /// The advertised protocols from `config` replace any already set on `tls`.
    pub fn with_tls_config(config: NegotiatorConfig, mut tls: ClientConfig) -> Self {
        tls.alpn_protocols = config.protocols.clone();
        Self {
            config: Arc::new(config),
            tls: Arc::new(tls),
        }
    }

    /// Get the configuration for this negotiator.
    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Connect to the target and negotiate the transport.
    ///
    /// Connection failures are reported as [`Error::Connection`] and are not
    /// retried. If the peer selects no protocol we know, the TLS session is
    /// shut down and [`Error::UnsupportedTransport`] is returned.
    pub async fn negotiate(
        &self,
        target: &ConnectionTarget,
    ) -> Result<NegotiatedStream<TlsStream>, Error> {
        let span = tracing::debug_span!("negotiate", host = %target.host(), port = target.port());
        self.negotiate_inner(target).instrument(span).await
    }

    async fn negotiate_inner(
        &self,
        target: &ConnectionTarget,
    ) -> Result<NegotiatedStream<TlsStream>, Error> {
        let domain = ServerName::try_from(target.host().to_owned()).map_err(|error| {
            Error::InvalidTarget(format!(
                "{:?} is not a valid server name: {error}",
                target.host()
            ))
        })?;

        let tcp = tcp::connect(target.host(), target.port(), &self.config.tcp)
            .await
            .map_err(Error::Connection)?;

        let stream = tokio_rustls::TlsConnector::from(self.tls.clone())
            .connect(domain, tcp)
            .await
            .map_err(Error::Connection)?;
        tracing::trace!("tls handshake complete");

        let mut info = TlsConnectionInfo::client(target.host(), !self.config.insecure_skip_verify);
        let (_, session) = stream.get_ref();
        if let Some((mechanism, protocol)) = strategy::resolve(&self.config.strategies, session) {
            info.negotiated(mechanism, protocol);
        }

        match info.transport() {
            Some(transport) => {
                tracing::debug!(%transport, mechanism = ?info.mechanism, "transport negotiated");
                Ok(NegotiatedStream {
                    stream,
                    transport,
                    tls: info,
                })
            }
            None => {
                let protocol = info.protocol_name();
                tracing::debug!(?protocol, "no supported transport negotiated");
                release(stream).await;
                Err(Error::UnsupportedTransport { protocol })
            }
        }
    }
}

/// Shut down and close a stream we are abandoning.
async fn release<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(error) = stream.shutdown().await {
        tracing::trace!(%error, "error shutting down abandoned stream");
    }
    drop(stream);
}

impl tower::Service<ConnectionTarget> for Negotiator {
    type Response = NegotiatedStream<TlsStream>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: ConnectionTarget) -> Self::Future {
        let negotiator = self.clone();
        Box::pin(async move { negotiator.negotiate(&target).await })
    }
}
