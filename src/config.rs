//! Agent, endpoint and upstream configuration.
//!
//! Options are translated into bind requests at `listen`/`forward` time;
//! scheme validation happens here, before any RPC is issued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use na_protocol::{
    Bind, BindExtra, BindLabel, EndpointOpts, HttpEndpointOpts, TcpEndpointOpts, TlsEndpointOpts,
};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use url::Url;

use crate::dial::{Dialer, TcpDialer};
use crate::errors::Error;
use crate::tls::TlsCustomizer;

/// Default ingress address of the cloud service.
pub const DEFAULT_SERVER_ADDR: &str = "connect.ngrok-agent.com:443";

/// Name of the environment variable holding the authtoken.
pub const AUTHTOKEN_ENV_VAR: &str = "NGROK_AUTHTOKEN";

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_TOLERANCE: Duration = Duration::from_secs(15);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Convenience: read the authtoken from `NGROK_AUTHTOKEN`.
pub fn authtoken_from_env() -> Option<String> {
    std::env::var(AUTHTOKEN_ENV_VAR).ok()
}

// ---------------------------------------------------------------------------
// Remote command surface
// ---------------------------------------------------------------------------

/// A command the server issued over the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Stop,
    Restart,
    Update {
        version: String,
        permit_major_version: bool,
    },
    StopTunnel {
        endpoint_id: String,
        message: String,
        error_code: String,
    },
}

/// Handles a remote command; an `Err` string is reported back to the
/// server verbatim.
pub type CommandHandler = Arc<dyn Fn(RemoteCommand) -> Result<(), String> + Send + Sync>;

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct AgentConfig {
    pub(crate) authtoken: String,
    pub(crate) server_addr: String,
    pub(crate) ca_roots: Option<RootCertStore>,
    pub(crate) tls_customizer: Option<TlsCustomizer>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) proxy_url: Option<Url>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_tolerance: Duration,
    pub(crate) metadata: String,
    pub(crate) description: String,
    pub(crate) auto_connect: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) command_handler: Option<CommandHandler>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            authtoken: String::new(),
            server_addr: DEFAULT_SERVER_ADDR.to_owned(),
            ca_roots: None,
            tls_customizer: None,
            dialer: Arc::new(TcpDialer),
            proxy_url: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            metadata: String::new(),
            description: String::new(),
            auto_connect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_handler: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// PROXY protocol version requested for an endpoint or upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyProto {
    #[default]
    None,
    V1,
    V2,
}

impl ProxyProto {
    pub(crate) fn wire_version(self) -> i32 {
        match self {
            ProxyProto::None => 0,
            ProxyProto::V1 => 1,
            ProxyProto::V2 => 2,
        }
    }

    pub(crate) fn is_enabled(self) -> bool {
        !matches!(self, ProxyProto::None)
    }
}

/// Options for a remotely-bound endpoint.
#[derive(Clone, Default)]
pub struct EndpointConfig {
    pub(crate) url: Option<String>,
    pub(crate) labels: BTreeMap<String, String>,
    pub(crate) bindings: Vec<String>,
    pub(crate) metadata: String,
    pub(crate) description: String,
    pub(crate) traffic_policy: String,
    pub(crate) pooling_enabled: bool,
    pub(crate) proxy_proto: ProxyProto,
    pub(crate) agent_tls: Option<Arc<ServerConfig>>,
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a specific endpoint URL, e.g. `https://app.example.com` or
    /// `tcp://`.  Missing scheme defaults to https.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Bind by label set instead of URL; mutually exclusive with a URL.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.bindings.push(binding.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Opaque traffic-policy document (YAML or JSON), passed verbatim.
    pub fn with_traffic_policy(mut self, policy: impl Into<String>) -> Self {
        self.traffic_policy = policy.into();
        self
    }

    pub fn with_pooling_enabled(mut self, enabled: bool) -> Self {
        self.pooling_enabled = enabled;
        self
    }

    /// Ask the edge to prepend a PROXY protocol preamble to each stream.
    pub fn with_proxy_proto(mut self, version: ProxyProto) -> Self {
        self.proxy_proto = version;
        self
    }

    /// Terminate TLS agent-side with this server config.
    pub fn with_agent_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.agent_tls = Some(config);
        self
    }

    /// Build the wire bind request.  `forwards_to` is display metadata for
    /// the address this endpoint ultimately delivers to.
    pub(crate) fn to_bind_request(&self, forwards_to: &str) -> Result<BindRequest, Error> {
        let extra = BindExtra {
            token: String::new(),
            metadata: self.metadata.clone(),
            description: self.description.clone(),
            bindings: self.bindings.clone(),
            pooling_enabled: self.pooling_enabled,
            traffic_policy: self.traffic_policy.clone(),
            forwards_to: forwards_to.to_owned(),
        };

        if !self.labels.is_empty() {
            if self.url.is_some() {
                return Err(Error::InvalidUrl {
                    url: self.url.clone().unwrap_or_default(),
                    reason: "an endpoint may be bound by URL or by labels, not both".to_owned(),
                });
            }
            return Ok(BindRequest::Label(BindLabel {
                labels: self.labels.clone(),
                extra,
            }));
        }

        let proxy_proto = self.proxy_proto.wire_version();
        let (proto, opts) = match self.url.as_deref() {
            None => (
                "https",
                EndpointOpts::Http(HttpEndpointOpts {
                    url: String::new(),
                    scheme: "https".to_owned(),
                    proxy_proto,
                }),
            ),
            Some(raw) => {
                let (scheme, url) = split_endpoint_url(raw)?;
                match scheme {
                    "http" | "https" => (
                        scheme,
                        EndpointOpts::Http(HttpEndpointOpts {
                            url,
                            scheme: scheme.to_owned(),
                            proxy_proto,
                        }),
                    ),
                    "tcp" => (
                        "tcp",
                        EndpointOpts::Tcp(TcpEndpointOpts { url, proxy_proto }),
                    ),
                    "tls" => (
                        "tls",
                        EndpointOpts::Tls(TlsEndpointOpts { url, proxy_proto }),
                    ),
                    other => return Err(Error::UnsupportedScheme(other.to_owned())),
                }
            }
        };

        Ok(BindRequest::Url(Bind {
            id: String::new(),
            proto: proto.to_owned(),
            opts: opts.to_wire(),
            extra,
        }))
    }
}

/// A bind request ready for the wire, split by registration flavor.
#[derive(Debug, Clone)]
pub(crate) enum BindRequest {
    Url(Bind),
    Label(BindLabel),
}

/// Normalize an endpoint URL: apply the https default and enforce the
/// scheme allow-list before anything reaches the server.
fn split_endpoint_url(raw: &str) -> Result<(&'static str, String), Error> {
    let normalized = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("https://{raw}")
    };
    let parsed = Url::parse(&normalized).map_err(|e| Error::InvalidUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    let scheme = match parsed.scheme() {
        "http" => "http",
        "https" => "https",
        "tcp" => "tcp",
        "tls" => "tls",
        other => return Err(Error::UnsupportedScheme(other.to_owned())),
    };
    Ok((scheme, normalized))
}

// ---------------------------------------------------------------------------
// Upstream configuration
// ---------------------------------------------------------------------------

/// Where a forwarder delivers traffic.
#[derive(Clone)]
pub struct Upstream {
    pub(crate) addr: String,
    pub(crate) app_proto: Option<String>,
    pub(crate) proxy_proto: ProxyProto,
    pub(crate) tls: Option<Arc<ClientConfig>>,
    pub(crate) dialer: Option<Arc<dyn Dialer>>,
}

impl Upstream {
    /// `addr` may be a bare port (`"8080"`), a `host:port`, or a full URL.
    /// A missing scheme defaults to http.
    pub fn new(addr: impl Into<String>) -> Self {
        Upstream {
            addr: addr.into(),
            app_proto: None,
            proxy_proto: ProxyProto::None,
            tls: None,
            dialer: None,
        }
    }

    /// Upstream protocol hint; `"http2"` negotiates h2 via ALPN.
    pub fn with_app_proto(mut self, proto: impl Into<String>) -> Self {
        self.app_proto = Some(proto.into());
        self
    }

    pub fn with_proxy_proto(mut self, version: ProxyProto) -> Self {
        self.proxy_proto = version;
        self
    }

    /// TLS client config for the upstream connection (custom roots, client
    /// certs).
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub(crate) fn target(&self) -> Result<UpstreamTarget, Error> {
        parse_upstream(&self.addr)
    }

    pub(crate) fn wants_http2(&self) -> bool {
        self.app_proto.as_deref() == Some("http2")
    }
}

/// A parsed upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpstreamTarget {
    pub(crate) scheme: &'static str,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl UpstreamTarget {
    /// http and https upstreams get the HTTP-aware path; everything else
    /// is a raw byte pipe.
    pub(crate) fn is_http(&self) -> bool {
        matches!(self.scheme, "http" | "https")
    }

    pub(crate) fn use_tls(&self) -> bool {
        matches!(self.scheme, "https" | "tls")
    }

    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_upstream(raw: &str) -> Result<UpstreamTarget, Error> {
    let invalid = |reason: &str| Error::InvalidUrl {
        url: raw.to_owned(),
        reason: reason.to_owned(),
    };

    // Bare port: forward to localhost.
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let port: u16 = raw.parse().map_err(|_| invalid("port out of range"))?;
        return Ok(UpstreamTarget {
            scheme: "http",
            host: "localhost".to_owned(),
            port,
        });
    }

    let normalized = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    };
    let parsed = Url::parse(&normalized).map_err(|e| Error::InvalidUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    let scheme = match parsed.scheme() {
        "http" => "http",
        "https" => "https",
        "tcp" => "tcp",
        "tls" => "tls",
        other => return Err(Error::UnsupportedScheme(other.to_owned())),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("missing host"))?
        .to_owned();
    let port = match parsed.port() {
        Some(p) => p,
        None => match scheme {
            "http" => 80,
            "https" | "tls" => 443,
            _ => return Err(invalid("tcp upstream requires an explicit port")),
        },
    };
    Ok(UpstreamTarget { scheme, host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_scheme_defaults_to_https() {
        let req = EndpointConfig::new()
            .with_url("app.example.com")
            .to_bind_request("")
            .unwrap();
        match req {
            BindRequest::Url(bind) => {
                assert_eq!(bind.proto, "https");
                let opts = EndpointOpts::from_wire(&bind.proto, &bind.opts).unwrap();
                match opts {
                    EndpointOpts::Http(http) => {
                        assert_eq!(http.scheme, "https");
                        assert_eq!(http.url, "https://app.example.com");
                    }
                    other => panic!("expected http opts, got {other:?}"),
                }
            }
            BindRequest::Label(_) => panic!("expected URL bind"),
        }
    }

    #[test]
    fn empty_config_binds_https_with_explicit_scheme() {
        let req = EndpointConfig::new().to_bind_request("").unwrap();
        match req {
            BindRequest::Url(bind) => {
                assert_eq!(bind.proto, "https");
                let opts = EndpointOpts::from_wire(&bind.proto, &bind.opts).unwrap();
                assert!(matches!(
                    opts,
                    EndpointOpts::Http(HttpEndpointOpts { ref scheme, .. }) if scheme == "https"
                ));
            }
            BindRequest::Label(_) => panic!("expected URL bind"),
        }
    }

    #[test]
    fn unsupported_schemes_are_rejected_before_any_rpc() {
        let err = EndpointConfig::new()
            .with_url("ftp://files.example.com")
            .to_bind_request("")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(ref s) if s == "ftp"));
    }

    #[test]
    fn labels_and_url_are_mutually_exclusive() {
        let err = EndpointConfig::new()
            .with_url("https://a.example.com")
            .with_label("edge", "my-edge")
            .to_bind_request("")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[test]
    fn label_config_produces_label_bind() {
        let req = EndpointConfig::new()
            .with_label("edge", "e1")
            .with_metadata("m")
            .to_bind_request("localhost:8080")
            .unwrap();
        match req {
            BindRequest::Label(bind) => {
                assert_eq!(bind.labels.get("edge").map(String::as_str), Some("e1"));
                assert_eq!(bind.extra.forwards_to, "localhost:8080");
            }
            BindRequest::Url(_) => panic!("expected label bind"),
        }
    }

    #[test]
    fn tcp_endpoint_carries_proxy_proto() {
        let req = EndpointConfig::new()
            .with_url("tcp://")
            .with_proxy_proto(ProxyProto::V2)
            .to_bind_request("")
            .unwrap();
        match req {
            BindRequest::Url(bind) => {
                assert_eq!(bind.proto, "tcp");
                let opts = EndpointOpts::from_wire(&bind.proto, &bind.opts).unwrap();
                assert_eq!(opts.proxy_proto(), 2);
            }
            BindRequest::Label(_) => panic!("expected URL bind"),
        }
    }

    #[test]
    fn upstream_bare_port_is_localhost_http() {
        let target = parse_upstream("8080").unwrap();
        assert_eq!(
            target,
            UpstreamTarget {
                scheme: "http",
                host: "localhost".to_owned(),
                port: 8080,
            }
        );
        assert!(target.is_http());
        assert!(!target.use_tls());
    }

    #[test]
    fn upstream_host_port_defaults_to_http() {
        let target = parse_upstream("10.0.0.5:9000").unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.addr(), "10.0.0.5:9000");
    }

    #[test]
    fn upstream_tls_url_is_raw_with_tls() {
        let target = parse_upstream("tls://db.internal:5432").unwrap();
        assert!(!target.is_http());
        assert!(target.use_tls());
        assert_eq!(target.port, 5432);
    }

    #[test]
    fn upstream_https_gets_default_port() {
        let target = parse_upstream("https://svc.internal").unwrap();
        assert_eq!(target.port, 443);
        assert!(target.is_http());
        assert!(target.use_tls());
    }

    #[test]
    fn upstream_tcp_without_port_is_rejected() {
        assert!(parse_upstream("tcp://svc.internal").is_err());
    }

    #[test]
    fn upstream_unknown_scheme_is_rejected() {
        assert!(matches!(
            parse_upstream("unix:///tmp/sock"),
            Err(Error::UnsupportedScheme(_))
        ));
    }
}
