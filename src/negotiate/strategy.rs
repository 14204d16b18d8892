//! Mechanisms for reading back the application protocol the peer selected.
//!
//! Strategies are tried in order once the handshake is complete; the first
//! one to report a selection wins.

use std::fmt;
use std::sync::Arc;

use rustls::ClientConnection;
use thiserror::Error;

/// The TLS implementation does not provide this negotiation mechanism.
#[derive(Debug, Error)]
#[error("{0} is not supported by this TLS implementation")]
pub struct Unsupported(pub &'static str);

/// A way of learning which application protocol the peer selected.
pub trait Negotiation: fmt::Debug + Send + Sync {
    /// Short name, used in logs and in [`TlsConnectionInfo`][crate::info::TlsConnectionInfo].
    fn name(&self) -> &'static str;

    /// The protocol identifier the peer selected through this mechanism.
    ///
    /// `Ok(None)` means the peer did not select anything; `Err(Unsupported)`
    /// means the mechanism is unavailable on this TLS stack altogether.
    fn selected(&self, session: &ClientConnection) -> Result<Option<Vec<u8>>, Unsupported>;
}

/// Application-Layer Protocol Negotiation (RFC 7301).
#[derive(Debug, Clone, Copy, Default)]
pub struct Alpn;

impl Negotiation for Alpn {
    fn name(&self) -> &'static str {
        "alpn"
    }

    fn selected(&self, session: &ClientConnection) -> Result<Option<Vec<u8>>, Unsupported> {
        Ok(session.alpn_protocol().map(<[u8]>::to_vec))
    }
}

/// Next Protocol Negotiation, the legacy predecessor of ALPN.
///
/// rustls never implemented NPN, so this always reports itself as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct Npn;

impl Negotiation for Npn {
    fn name(&self) -> &'static str {
        "npn"
    }

    fn selected(&self, _session: &ClientConnection) -> Result<Option<Vec<u8>>, Unsupported> {
        Err(Unsupported("npn"))
    }
}

/// ALPN first, falling back to NPN.
pub fn default_strategies() -> Vec<Arc<dyn Negotiation>> {
    vec![Arc::new(Alpn), Arc::new(Npn)]
}

/// Run the strategies in order, returning the first selection and the
/// mechanism that produced it.
pub(crate) fn resolve(
    strategies: &[Arc<dyn Negotiation>],
    session: &ClientConnection,
) -> Option<(&'static str, Vec<u8>)> {
    for strategy in strategies {
        match strategy.selected(session) {
            Ok(Some(protocol)) => {
                tracing::trace!(
                    mechanism = strategy.name(),
                    protocol = %String::from_utf8_lossy(&protocol),
                    "peer selected protocol"
                );
                return Some((strategy.name(), protocol));
            }
            Ok(None) => {
                tracing::trace!(mechanism = strategy.name(), "peer selected no protocol");
            }
            Err(unsupported) => {
                tracing::trace!(mechanism = strategy.name(), "{unsupported}");
            }
        }
    }
    None
}
