//! Library error taxonomy.
//!
//! Configuration problems are caught before any network I/O; transport and
//! auth failures feed the reconnect loop; bind rejections surface directly
//! from `listen`/`forward` and are never retried.

use na_protocol::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme `{0}`; expected http, https, tcp or tls")]
    UnsupportedScheme(String),
    #[error("invalid proxy URL: {0}")]
    InvalidProxyUrl(String),
    #[error("failed to dial server: {0}")]
    Dial(#[source] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    /// The auth request could not be delivered (local transport failure).
    #[error("failed to send authentication request: {0}")]
    AuthLocal(String),
    /// The server rejected the auth request.
    #[error("authentication failed: {0}")]
    AuthRemote(#[source] RemoteError),
    /// The server rejected an endpoint registration.
    #[error("endpoint registration failed: {0}")]
    Bind(#[source] RemoteError),
    /// The multiplex failed while waiting for a server-originated stream.
    #[error("session accept failed: {0}")]
    Accept(String),
    #[error("RPC failed: {0}")]
    Rpc(String),
    #[error("failed to dial upstream {addr}: {source}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// The HTTP-aware forwarding path failed mid-connection.
    #[error("HTTP forwarding: {0}")]
    Http(String),
    #[error("PROXY header: {0}")]
    ProxyHeader(String),
    #[error("agent is already connected")]
    AlreadyConnected,
    #[error("agent is not connected")]
    NotConnected,
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Whether the reconnect loop may retry after this error.  Bind
    /// rejections and lifecycle misuse are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Dial(_)
                | Error::Tls(_)
                | Error::AuthLocal(_)
                | Error::AuthRemote(_)
                | Error::Accept(_)
                | Error::Rpc(_)
        )
    }

    /// The branded error code carried by a remote rejection, if any.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Error::AuthRemote(e) | Error::Bind(e) => e.code(),
            _ => None,
        }
    }
}
