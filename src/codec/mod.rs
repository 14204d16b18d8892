//! Protocol codecs.
//!
//! A codec turns logical requests into bytes for one transport framing, and
//! reassembles responses from whatever chunks the socket hands back. The
//! session driver only ever talks to a codec through [`Codec`], and creates
//! one per connection through [`BindTransport`] once the transport is known.

use std::fmt;

use bytes::Bytes;

use crate::info::TransportType;

mod command;
pub mod matrix;

pub use self::command::{Command, SyncOptions};

/// The outcome of feeding bytes to a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<R> {
    /// More bytes are needed before a response is complete.
    Incomplete,

    /// A complete, decoded response.
    Complete(R),
}

impl<R> Decoded<R> {
    /// Returns the response, if one is complete.
    pub fn complete(self) -> Option<R> {
        match self {
            Decoded::Complete(response) => Some(response),
            Decoded::Incomplete => None,
        }
    }

    /// Whether a response is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self, Decoded::Complete(_))
    }
}

/// A stateful protocol codec, fixed to one transport framing.
///
/// Codecs own their accumulation buffer: [`Codec::feed`] may be called with
/// arbitrarily small chunks, and must produce the same response no matter
/// where the chunk boundaries fall.
pub trait Codec {
    /// The decoded response type.
    type Response: fmt::Debug;

    /// Errors raised while encoding or decoding.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The transport framing this codec was bound to.
    fn transport(&self) -> TransportType;

    /// Bytes to send before any request, such as a connection preface.
    ///
    /// No response is expected. May be empty.
    fn connect_preamble(&mut self) -> Bytes;

    /// Serialize a login request.
    fn login_request(&mut self, user: &str, credential: &str) -> Result<Bytes, Self::Error>;

    /// Serialize an application command.
    fn command_request(&mut self, command: &Command) -> Result<Bytes, Self::Error>;

    /// Bytes to send when leaving the connection. May be empty.
    fn disconnect_message(&mut self) -> Bytes;

    /// Consume newly-arrived bytes, returning a response once one is complete.
    fn feed(&mut self, data: &[u8]) -> Result<Decoded<Self::Response>, Self::Error>;
}

/// Something which can produce a [`Codec`] for a negotiated transport.
pub trait BindTransport {
    /// The codec produced.
    type Codec: Codec;

    /// Create a codec fixed to `transport` framing.
    fn bind(self, transport: TransportType) -> Self::Codec;
}
