//! Matrix client-server API requests and responses.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};

use super::{CodecError, RawResponse};
use crate::codec::SyncOptions;

pub(super) const LOGIN_PATH: &str = "/_matrix/client/v3/login";
pub(super) const SYNC_PATH: &str = "/_matrix/client/v3/sync";

const APPLICATION_JSON: &str = "application/json";
const AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Which request a pending response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RequestKind {
    Login,
    Sync,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    identifier: UserIdentifier<'a>,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_device_display_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UserIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    user: &'a str,
}

fn builder(method: Method, authority: &str, path: &str) -> http::request::Builder {
    Request::builder()
        .method(method)
        .uri(format!("https://{authority}{path}"))
        .header(USER_AGENT, AGENT)
        .header(ACCEPT, APPLICATION_JSON)
}

pub(super) fn login(
    authority: &str,
    user: &str,
    password: &str,
    device_name: Option<&str>,
) -> Result<Request<Bytes>, CodecError> {
    let body = serde_json::to_vec(&LoginRequest {
        kind: "m.login.password",
        identifier: UserIdentifier {
            kind: "m.id.user",
            user,
        },
        password,
        initial_device_display_name: device_name,
    })?;

    Ok(builder(Method::POST, authority, LOGIN_PATH)
        .header(CONTENT_TYPE, APPLICATION_JSON)
        .body(Bytes::from(body))?)
}

pub(super) fn sync(
    authority: &str,
    access_token: &str,
    options: &SyncOptions,
) -> Result<Request<Bytes>, CodecError> {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if let Some(since) = &options.since {
        query.append_pair("since", since);
    }
    if let Some(timeout) = options.timeout {
        query.append_pair("timeout", &timeout.as_millis().to_string());
    }
    if let Some(filter) = &options.filter {
        query.append_pair("filter", filter);
    }
    if options.full_state {
        query.append_pair("full_state", "true");
    }

    let query = query.finish();
    let path = if query.is_empty() {
        SYNC_PATH.to_owned()
    } else {
        format!("{SYNC_PATH}?{query}")
    };

    Ok(builder(Method::GET, authority, &path)
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Bytes::new())?)
}

/// A successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    /// The fully-qualified user ID that logged in.
    pub user_id: String,

    /// The access credential for subsequent requests.
    pub access_token: String,

    /// The device the session is bound to.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Rooms in a sync response, keyed by room ID.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Rooms {
    /// Rooms the user has joined.
    #[serde(default)]
    pub join: BTreeMap<String, serde_json::Value>,

    /// Rooms the user has been invited to.
    #[serde(default)]
    pub invite: BTreeMap<String, serde_json::Value>,

    /// Rooms the user has left or been banned from.
    #[serde(default)]
    pub leave: BTreeMap<String, serde_json::Value>,
}

/// A successful sync.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncResponse {
    /// Token to pass as `since` on the next sync.
    pub next_batch: String,

    /// Room updates.
    #[serde(default)]
    pub rooms: Rooms,

    /// Everything else in the response, left undecoded.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// An error reported by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorResponse {
    /// Matrix error code, e.g. `M_FORBIDDEN`.
    pub errcode: String,

    /// Human readable description.
    #[serde(default)]
    pub error: String,

    /// How long to wait before retrying, for rate-limit errors.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,

    /// The HTTP status, when the framing exposed it.
    #[serde(skip)]
    pub status: Option<u16>,
}

/// A decoded homeserver response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Reply to a login request.
    Login(LoginResponse),

    /// Reply to a sync request.
    Sync(SyncResponse),

    /// The request failed.
    Error(ErrorResponse),
}

impl Response {
    /// The access credential granted by a successful login.
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Response::Login(login) => Some(&login.access_token),
            _ => None,
        }
    }

    /// Whether the server reported an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Login(login) => {
                write!(f, "LoginResponse user_id={}", login.user_id)?;
                if let Some(device) = &login.device_id {
                    write!(f, " device_id={device}")?;
                }
                Ok(())
            }
            Response::Sync(sync) => write!(
                f,
                "SyncResponse next_batch={} joined={} invited={} left={}",
                sync.next_batch,
                sync.rooms.join.len(),
                sync.rooms.invite.len(),
                sync.rooms.leave.len()
            ),
            Response::Error(error) => {
                write!(f, "ErrorResponse")?;
                if let Some(status) = error.status {
                    write!(f, " status={status}")?;
                }
                write!(f, " {}: {}", error.errcode, error.error)
            }
        }
    }
}

/// Classify and decode a response body.
pub(super) fn decode(kind: RequestKind, raw: RawResponse) -> Result<Response, CodecError> {
    let failed = raw.status.is_some_and(|status| !status.is_success());

    let value: serde_json::Value = if raw.body.is_empty() {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&raw.body) {
            Ok(value) => value,
            // Proxies answer failures with HTML pages.
            Err(error) if failed => {
                tracing::debug!(%error, "error response body is not JSON");
                serde_json::Value::Null
            }
            Err(error) => return Err(error.into()),
        }
    };

    if failed || value.get("errcode").is_some() {
        let mut error = serde_json::from_value::<ErrorResponse>(value).unwrap_or_else(|_| {
            ErrorResponse {
                errcode: "M_UNKNOWN".to_owned(),
                error: raw
                    .status
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("request failed")
                    .to_owned(),
                retry_after_ms: None,
                status: None,
            }
        });
        error.status = raw.status.map(|status| status.as_u16());
        return Ok(Response::Error(error));
    }

    match kind {
        RequestKind::Login => Ok(Response::Login(serde_json::from_value(value)?)),
        RequestKind::Sync => Ok(Response::Sync(serde_json::from_value(value)?)),
    }
}
