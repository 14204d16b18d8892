//! Matrix Driver
//!
//! Transport negotiation and a session driver for a Matrix command-line
//! client. A [`Negotiator`] opens a TLS connection and works out whether the
//! server speaks HTTP/2 or HTTP/1.1; a [`Session`] then drives connect,
//! login, commands and disconnect over that connection through a [`Codec`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
mod error;
pub mod info;
pub mod negotiate;
pub mod session;

pub use codec::{BindTransport, Codec, Command, Decoded};
pub use error::Error;
pub use info::{ConnectionTarget, TransportType};
pub use negotiate::{NegotiatedStream, Negotiator, NegotiatorConfig};
pub use session::{Session, SessionConfig};

/// A type-erased error, as carried by [`Error::Codec`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
