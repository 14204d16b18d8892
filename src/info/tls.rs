//! Information about a TLS connection.
//!
//! TLS information is a bit tricky, because it is really only available after the handshake is complete.

use super::TransportType;

/// Information about a TLS connection, captured once the handshake is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// The server name sent in the SNI extension.
    pub server_name: Option<String>,

    /// Whether the server certificate chain and name were validated.
    pub validated_server_name: bool,

    /// The raw application protocol identifier the peer selected, if any.
    pub protocol: Option<Vec<u8>>,

    /// The negotiation mechanism which produced `protocol`.
    pub mechanism: Option<&'static str>,
}

impl TlsConnectionInfo {
    pub(crate) fn client(server_name: &str, validated: bool) -> Self {
        Self {
            server_name: Some(server_name.to_owned()).filter(|s| !s.is_empty()),
            validated_server_name: validated,
            protocol: None,
            mechanism: None,
        }
    }

    pub(crate) fn negotiated(&mut self, mechanism: &'static str, protocol: Vec<u8>) {
        self.mechanism = Some(mechanism);
        self.protocol = Some(protocol);
    }

    /// The negotiated protocol identifier as text, lossily decoded.
    pub fn protocol_name(&self) -> Option<String> {
        self.protocol
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    /// The transport type matching the negotiated protocol, if it is one we know.
    pub fn transport(&self) -> Option<TransportType> {
        self.protocol
            .as_deref()
            .and_then(TransportType::from_identifier)
    }
}
