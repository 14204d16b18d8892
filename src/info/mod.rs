//! Connection Information
//!
//! Where to connect, and which application-layer transport was agreed on
//! once the connection is established.

use std::fmt;
use std::str::FromStr;

use crate::Error;

pub mod tls;
pub use self::tls::TlsConnectionInfo;

/// The server used when no host is given.
pub const DEFAULT_HOST: &str = "matrix.org";

/// The standard port for HTTPS.
pub const DEFAULT_PORT: u16 = 443;

/// The application-layer transport framing used on a connection.
///
/// This is chosen once per connection, during the TLS handshake, and
/// does not change for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// HTTP/1.1 framing
    Http1,

    /// HTTP/2 framing
    Http2,
}

impl TransportType {
    /// The protocol identifier used during negotiation.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::Http1 => "http/1.1",
            Self::Http2 => "h2",
        }
    }

    /// Look up a transport type by its negotiated protocol identifier.
    pub fn from_identifier(identifier: &[u8]) -> Option<Self> {
        match identifier {
            b"http/1.1" => Some(Self::Http1),
            b"h2" => Some(Self::Http2),
            _ => None,
        }
    }

    /// The identifiers advertised during negotiation, in preference order.
    pub fn advertised() -> Vec<Vec<u8>> {
        vec![
            Self::Http2.identifier().as_bytes().to_vec(),
            Self::Http1.identifier().as_bytes().to_vec(),
        ]
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http1 => f.write_str("HTTP/1.1"),
            Self::Http2 => f.write_str("HTTP/2"),
        }
    }
}

impl From<TransportType> for http::Version {
    fn from(transport: TransportType) -> Self {
        match transport {
            TransportType::Http1 => http::Version::HTTP_11,
            TransportType::Http2 => http::Version::HTTP_2,
        }
    }
}

/// The remote endpoint and the user we are acting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    host: String,
    port: u16,
    user: String,
}

impl ConnectionTarget {
    /// Create a new target, falling back to the default host and port.
    pub fn new(host: Option<&str>, port: Option<u16>, user: impl Into<String>) -> Self {
        Self {
            host: host
                .filter(|h| !h.is_empty())
                .unwrap_or(DEFAULT_HOST)
                .to_owned(),
            port: port.unwrap_or(DEFAULT_PORT),
            user: user.into(),
        }
    }

    /// Parse a `host[:port]` address, and attach the user identifier.
    pub fn parse(address: &str, user: impl Into<String>) -> Result<Self, Error> {
        let (host, port) = split_host_port(address)?;
        Ok(Self::new(Some(host), port, user))
    }

    /// The host name or address to connect to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port to connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The user identifier to authenticate as.
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ConnectionTarget {
    type Err = Error;

    /// Parse a `host[:port]` address with no user attached.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, "")
    }
}

fn split_host_port(address: &str) -> Result<(&str, Option<u16>), Error> {
    let invalid = || {
        Error::InvalidTarget(format!(
            "hosts need to be in format host:[port], got {address:?}"
        ))
    };

    // Bracketed IPv6 literal, e.g. [::1]:8448
    if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        return match rest {
            "" => Ok((host, None)),
            _ => {
                let port = rest.strip_prefix(':').ok_or_else(invalid)?;
                Ok((host, Some(parse_port(port).ok_or_else(invalid)?)))
            }
        };
    }

    match address.split_once(':') {
        None => Ok((address, None)),
        Some((host, "")) => Ok((host, None)),
        Some((host, port)) => Ok((host, Some(parse_port(port).ok_or_else(invalid)?))),
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse().ok().filter(|port| *port > 0)
}
