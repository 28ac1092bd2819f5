//! Opening Handshake (RFC 6455 §4.2)
//!
//! ```text
//! GET /chat HTTP/1.1
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//!
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use crate::http::{Request, Response, StatusCode, Version};
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WS_VERSION: &str = "13";

/// Why an upgrade request was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported websocket version: {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
}

impl HandshakeError {
    /// The HTTP response sent instead of `101`.
    pub fn to_response(&self, version: Version) -> Response {
        let response = Response::new(version, StatusCode::BadRequest)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(format!("{}\n", self));
        match self {
            HandshakeError::UnsupportedVersion(_) => response
                .with_status(StatusCode::UpgradeRequired)
                .with_header("Sec-WebSocket-Version", WS_VERSION),
            HandshakeError::MissingKey => response,
        }
    }
}

/// Computes `Sec-WebSocket-Accept` for a client key.
///
/// ```
/// # use sockmux::websocket::compute_accept_key;
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// True for an HTTP/1.1 request asking to switch to the websocket protocol.
pub fn is_upgrade_request(request: &Request) -> bool {
    request.version == Version::Http11
        && request.headers.has_token("connection", "upgrade")
        && request
            .header("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Validates an upgrade request and builds the `101` response.
pub fn accept(request: &Request) -> Result<Response, HandshakeError> {
    let version = request.header("sec-websocket-version");
    if version.map(str::trim) != Some(WS_VERSION) {
        return Err(HandshakeError::UnsupportedVersion(version.map(str::to_string)));
    }
    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(Response::new(Version::Http11, StatusCode::SwitchingProtocols)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", compute_accept_key(key)))
}
