//! A codec for the Matrix client-server API.
//!
//! [`MatrixClient`] holds the per-user settings and is bound to a negotiated
//! transport to produce a [`MatrixCodec`]. The codec frames requests as
//! HTTP/1.1 or HTTP/2 and decodes JSON responses into [`Response`].

use std::collections::VecDeque;

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

use crate::codec::{BindTransport, Codec, Command, Decoded};
use crate::info::{ConnectionTarget, TransportType, DEFAULT_PORT};

mod api;
mod hpack;
mod http1;
mod http2;

use self::api::RequestKind;
pub use self::api::{ErrorResponse, LoginResponse, Response, Rooms, SyncResponse};

/// Errors raised by the Matrix codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The HTTP/1.1 response head could not be parsed.
    #[error("malformed HTTP/1.1 response: {0}")]
    Http1(#[from] httparse::Error),

    /// A chunked response body was malformed.
    #[error("invalid chunked transfer coding")]
    InvalidChunk,

    /// The response declared neither a content length nor chunked coding.
    #[error("response body has no length or chunked framing")]
    UnframedBody,

    /// A response header had an unusable value.
    #[error("invalid response header: {0}")]
    InvalidHeader(&'static str),

    /// The peer violated the HTTP/2 framing rules.
    #[error("HTTP/2 protocol error: {0}")]
    Http2(&'static str),

    /// The server reset the stream carrying our request.
    #[error("stream reset by server (error code {0:#x})")]
    StreamReset(u32),

    /// The server is going away and will not answer our request.
    #[error("server sent GOAWAY (error code {code:#x}, last stream {last_stream})")]
    GoAway {
        /// HTTP/2 error code.
        code: u32,

        /// Highest stream the server processed.
        last_stream: u32,
    },

    /// A response arrived with no request outstanding.
    #[error("response received with no request outstanding")]
    UnexpectedResponse,

    /// A command needs an access token, and there has been no successful login.
    #[error("not logged in")]
    NotAuthenticated,

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    /// The response body was not the JSON we expected.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A fully framed HTTP response, before the body is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawResponse {
    pub(crate) status: Option<StatusCode>,
    pub(crate) body: Bytes,
}

/// Settings for talking to one homeserver as one user.
#[derive(Debug, Clone)]
pub struct MatrixClient {
    authority: String,
    device_name: Option<String>,
    access_token: Option<String>,
}

impl MatrixClient {
    /// Create a client for the homeserver at `authority` (`host` or `host:port`).
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            device_name: None,
            access_token: None,
        }
    }

    /// Create a client addressing the target's host, with the port if it is not the default.
    pub fn for_target(target: &ConnectionTarget) -> Self {
        if target.port() == DEFAULT_PORT {
            if target.host().contains(':') {
                Self::new(format!("[{}]", target.host()))
            } else {
                Self::new(target.host())
            }
        } else {
            Self::new(target.to_string())
        }
    }

    /// Set the display name for the device created at login.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Reuse an access token from an earlier login.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// The authority requests are addressed to.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl BindTransport for MatrixClient {
    type Codec = MatrixCodec;

    fn bind(self, transport: TransportType) -> Self::Codec {
        MatrixCodec::new(self, transport)
    }
}

#[derive(Debug)]
enum Framing {
    Http1(http1::Http1),
    Http2(http2::Http2),
}

/// Matrix codec bound to one transport framing.
#[derive(Debug)]
pub struct MatrixCodec {
    client: MatrixClient,
    framing: Framing,
    pending: VecDeque<RequestKind>,
}

impl MatrixCodec {
    /// Create a codec for `transport` framing.
    pub fn new(client: MatrixClient, transport: TransportType) -> Self {
        let framing = match transport {
            TransportType::Http1 => Framing::Http1(http1::Http1::default()),
            TransportType::Http2 => Framing::Http2(http2::Http2::default()),
        };

        Self {
            client,
            framing,
            pending: VecDeque::new(),
        }
    }

    /// The access token from the most recent successful login.
    pub fn access_token(&self) -> Option<&str> {
        self.client.access_token.as_deref()
    }

    fn encode(
        &mut self,
        kind: RequestKind,
        request: http::Request<Bytes>,
    ) -> Result<Bytes, CodecError> {
        let bytes = match &mut self.framing {
            Framing::Http1(framing) => framing.encode(&request),
            Framing::Http2(framing) => framing.encode(&request)?,
        };
        self.pending.push_back(kind);
        Ok(bytes)
    }
}

impl Codec for MatrixCodec {
    type Response = Response;
    type Error = CodecError;

    fn transport(&self) -> TransportType {
        match self.framing {
            Framing::Http1(_) => TransportType::Http1,
            Framing::Http2(_) => TransportType::Http2,
        }
    }

    fn connect_preamble(&mut self) -> Bytes {
        match &mut self.framing {
            Framing::Http1(_) => Bytes::new(),
            Framing::Http2(framing) => framing.preface(),
        }
    }

    fn login_request(&mut self, user: &str, credential: &str) -> Result<Bytes, Self::Error> {
        let request = api::login(
            &self.client.authority,
            user,
            credential,
            self.client.device_name.as_deref(),
        )?;
        self.encode(RequestKind::Login, request)
    }

    fn command_request(&mut self, command: &Command) -> Result<Bytes, Self::Error> {
        match command {
            Command::Sync(options) => {
                let token = self
                    .client
                    .access_token
                    .as_deref()
                    .ok_or(CodecError::NotAuthenticated)?;
                let request = api::sync(&self.client.authority, token, options)?;
                self.encode(RequestKind::Sync, request)
            }
        }
    }

    fn disconnect_message(&mut self) -> Bytes {
        match &mut self.framing {
            Framing::Http1(_) => Bytes::new(),
            Framing::Http2(framing) => framing.goaway(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<Decoded<Self::Response>, Self::Error> {
        let raw = match &mut self.framing {
            Framing::Http1(framing) => framing.decode(data)?,
            Framing::Http2(framing) => framing.decode(data)?,
        };

        let Some(raw) = raw else {
            return Ok(Decoded::Incomplete);
        };

        let kind = self
            .pending
            .pop_front()
            .ok_or(CodecError::UnexpectedResponse)?;
        let response = api::decode(kind, raw)?;

        if let Response::Login(login) = &response {
            self.client.access_token = Some(login.access_token.clone());
        }

        Ok(Decoded::Complete(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_BODY: &str =
        r#"{"user_id":"@alice:example.org","access_token":"syt_token","device_id":"DEV"}"#;

    fn http1_response(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    fn feed_all<C: Codec>(codec: &mut C, data: &[u8], chunk: usize) -> C::Response {
        let mut result = None;
        for part in data.chunks(chunk) {
            assert!(result.is_none(), "response completed before all bytes were fed");
            result = codec.feed(part).unwrap().complete();
        }
        result.expect("response should be complete")
    }

    #[test]
    fn bind_selects_framing() {
        let client = MatrixClient::new("example.org");
        assert_eq!(
            client.clone().bind(TransportType::Http1).transport(),
            TransportType::Http1
        );
        assert_eq!(
            client.bind(TransportType::Http2).transport(),
            TransportType::Http2
        );
    }

    #[test]
    fn authority_for_target() {
        let target = ConnectionTarget::parse("example.org", "alice").unwrap();
        assert_eq!(MatrixClient::for_target(&target).authority(), "example.org");

        let target = ConnectionTarget::parse("example.org:8448", "alice").unwrap();
        assert_eq!(
            MatrixClient::for_target(&target).authority(),
            "example.org:8448"
        );

        let target = ConnectionTarget::parse("[::1]", "alice").unwrap();
        assert_eq!(MatrixClient::for_target(&target).authority(), "[::1]");
    }

    #[test]
    fn sync_requires_login() {
        let mut codec = MatrixClient::new("example.org").bind(TransportType::Http1);
        let err = codec.command_request(&Command::sync()).unwrap_err();
        assert!(matches!(err, CodecError::NotAuthenticated));
    }

    #[test]
    fn login_stores_access_token() {
        let mut codec = MatrixClient::new("example.org").bind(TransportType::Http1);
        assert!(codec.connect_preamble().is_empty());

        codec.login_request("alice", "hunter2").unwrap();
        let response = feed_all(&mut codec, &http1_response(LOGIN_BODY), 4096);
        assert_eq!(response.access_token(), Some("syt_token"));
        assert_eq!(codec.access_token(), Some("syt_token"));

        let request = codec.command_request(&Command::sync()).unwrap();
        let request = std::str::from_utf8(&request).unwrap();
        assert!(request.starts_with("GET /_matrix/client/v3/sync HTTP/1.1\r\n"));
        assert!(request.contains("authorization: Bearer syt_token\r\n"));
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let data = http1_response(LOGIN_BODY);

        let mut whole = MatrixClient::new("example.org").bind(TransportType::Http1);
        whole.login_request("alice", "hunter2").unwrap();
        let whole = feed_all(&mut whole, &data, data.len());

        let mut bytewise = MatrixClient::new("example.org").bind(TransportType::Http1);
        bytewise.login_request("alice", "hunter2").unwrap();
        let bytewise = feed_all(&mut bytewise, &data, 1);

        assert_eq!(whole, bytewise);
    }

    #[test]
    fn unexpected_response() {
        let mut codec = MatrixClient::new("example.org").bind(TransportType::Http1);
        let err = codec.feed(&http1_response(LOGIN_BODY)).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedResponse));
    }

    #[test]
    fn existing_access_token() {
        let mut codec = MatrixClient::new("example.org")
            .with_access_token("syt_old")
            .bind(TransportType::Http2);
        assert!(codec.command_request(&Command::sync()).is_ok());
    }
}
