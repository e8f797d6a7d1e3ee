// na-protocol: Control-plane message types and serialization.
//
// Every RPC exchanges exactly one JSON object in each direction on a fresh
// typed stream; the stream type is the request-type constant.  Field names
// are frozen wire identifiers -- renaming any of them is a protocol break.

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod remote_err;

pub use remote_err::RemoteError;

// ---------------------------------------------------------------------------
// Stream type constants
// ---------------------------------------------------------------------------

/// Frozen request-type constants.  The numeric value doubles as the
/// stream-type tag on the multiplex; never reassign one.
pub mod types {
    pub const AUTH: u8 = 0;
    pub const BIND: u8 = 1;
    pub const UNBIND: u8 = 2;
    pub const PROXY: u8 = 3;
    pub const RESTART: u8 = 4;
    pub const STOP: u8 = 5;
    pub const UPDATE: u8 = 6;
    pub const BIND_LABEL: u8 = 7;
    pub const SRV_INFO: u8 = 8;
    pub const STOP_TUNNEL: u8 = 9;
}

/// Client version string sent in `Auth`.
pub const CLIENT_VERSION: &str = concat!("library/official/rust/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// First message on a new control connection.
///
/// `client_id` is empty on the first connect; on reconnect it carries the
/// identifier returned by the previous `AuthResp` so the server can
/// re-associate the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Authtoken")]
    pub authtoken: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    /// Milliseconds between heartbeat probes.
    #[serde(rename = "HeartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    /// Milliseconds without a heartbeat reply before the session is dead.
    #[serde(rename = "HeartbeatTolerance")]
    pub heartbeat_tolerance_ms: u64,
    #[serde(rename = "Extra")]
    pub extra: AuthExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthExtra {
    /// Opaque user metadata attached to the whole session.
    #[serde(rename = "Metadata")]
    pub metadata: String,
    /// Human description of this agent instance.
    #[serde(rename = "Description")]
    pub description: String,
    /// Reconnect cookie from the previous session, empty on first connect.
    #[serde(rename = "Cookie")]
    pub cookie: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResp {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ClientID")]
    pub client_id: String,
    /// Non-empty on rejection; may carry a branded `ERR_NGROK_<n>` code.
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Extra")]
    pub extra: AuthRespExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRespExtra {
    #[serde(rename = "Region")]
    pub region: String,
    /// Cookie to present in the next `Auth` after a reconnect.
    #[serde(rename = "Cookie")]
    pub cookie: String,
}

// ---------------------------------------------------------------------------
// Bind / BindLabel / Unbind
// ---------------------------------------------------------------------------

/// Register a URL-bound endpoint.
///
/// `id` is empty on first bind; a re-registration after reconnect carries
/// the old endpoint ID, which the server preserves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    #[serde(rename = "ID")]
    pub id: String,
    /// Endpoint protocol discriminant: "http", "https", "tcp" or "tls".
    #[serde(rename = "Proto")]
    pub proto: String,
    /// Protocol-specific options; unpack with [`EndpointOpts::from_wire`].
    #[serde(rename = "Opts")]
    pub opts: serde_json::Value,
    #[serde(rename = "Extra")]
    pub extra: BindExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindExtra {
    /// Reconnect token from the first `BindResp`; empty on first bind.
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Metadata")]
    pub metadata: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Bindings")]
    pub bindings: Vec<String>,
    #[serde(rename = "PoolingEnabled")]
    pub pooling_enabled: bool,
    /// Opaque policy document (YAML or JSON), transported verbatim.
    #[serde(rename = "TrafficPolicy")]
    pub traffic_policy: String,
    /// Address the agent forwards this endpoint to, for display purposes.
    #[serde(rename = "ForwardsTo")]
    pub forwards_to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResp {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Proto")]
    pub proto: String,
    #[serde(rename = "Opts")]
    pub opts: serde_json::Value,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Extra")]
    pub extra: BindRespExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRespExtra {
    /// Token the client must replay in `BindExtra.token` on reconnect.
    #[serde(rename = "Token")]
    pub token: String,
}

/// Register a label-bound endpoint.  The server may assign a fresh ID on
/// every (re-)registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindLabel {
    #[serde(rename = "Labels")]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(rename = "Extra")]
    pub extra: BindExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindLabelResp {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Extra")]
    pub extra: BindRespExtra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unbind {
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindResp {
    #[serde(rename = "Error")]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Protocol-specific endpoint options
// ---------------------------------------------------------------------------

/// PROXY protocol version requested for an endpoint: 0 = off.
pub type ProxyProtoVersion = i32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpointOpts {
    #[serde(rename = "URL")]
    pub url: String,
    /// Always set explicitly for https endpoints.
    #[serde(rename = "Scheme")]
    pub scheme: String,
    #[serde(rename = "ProxyProto")]
    pub proxy_proto: ProxyProtoVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpointOpts {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "ProxyProto")]
    pub proxy_proto: ProxyProtoVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsEndpointOpts {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "ProxyProto")]
    pub proxy_proto: ProxyProtoVersion,
}

/// Options unpacked from the wire according to the `proto` discriminant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointOpts {
    Http(HttpEndpointOpts),
    Tcp(TcpEndpointOpts),
    Tls(TlsEndpointOpts),
}

impl EndpointOpts {
    /// Unpack the opaque `Opts` value from a bind request or response.
    pub fn from_wire(proto: &str, opts: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match proto {
            "http" | "https" => serde_json::from_value(opts.clone()).map(EndpointOpts::Http),
            "tcp" => serde_json::from_value(opts.clone()).map(EndpointOpts::Tcp),
            _ => serde_json::from_value(opts.clone()).map(EndpointOpts::Tls),
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            EndpointOpts::Http(o) => serde_json::to_value(o),
            EndpointOpts::Tcp(o) => serde_json::to_value(o),
            EndpointOpts::Tls(o) => serde_json::to_value(o),
        }
        .expect("endpoint opts are always representable as JSON")
    }

    pub fn proxy_proto(&self) -> ProxyProtoVersion {
        match self {
            EndpointOpts::Http(o) => o.proxy_proto,
            EndpointOpts::Tcp(o) => o.proxy_proto,
            EndpointOpts::Tls(o) => o.proxy_proto,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvInfo {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvInfoResp {
    #[serde(rename = "Region")]
    pub region: String,
}

// ---------------------------------------------------------------------------
// Server-initiated commands
// ---------------------------------------------------------------------------

/// Commands arrive as server-opened typed streams; the payload is decoded,
/// dispatched to the agent's command handler, and a reply with an `Error`
/// field is written back on the same stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restart {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "PermitMajorVersion")]
    pub permit_major_version: bool,
}

/// Stop a single tunnel without tearing the session down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTunnel {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "ErrorCode")]
    pub error_code: String,
}

/// Reply written back for any server-initiated command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResp {
    #[serde(rename = "Error")]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Proxy stream header
// ---------------------------------------------------------------------------

/// Preamble on every server-originated proxy stream, identifying the
/// endpoint and the original client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHeader {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ClientAddr")]
    pub client_addr: String,
    #[serde(rename = "Proto")]
    pub proto: String,
    #[serde(rename = "EdgeType")]
    pub edge_type: String,
    /// True when the payload is end-to-end TLS that the agent must not
    /// terminate.
    #[serde(rename = "PassthroughTLS")]
    pub passthrough_tls: bool,
}
