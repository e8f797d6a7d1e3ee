//! Embeddable client for the ngrok reverse-proxy service.
//!
//! The library dials the cloud ingress over TLS, authenticates, and
//! multiplexes typed RPC streams, heartbeats, and per-connection proxy
//! streams over the single transport.  Incoming streams reach the caller
//! either through a [`Listener`] (accepted connections) or a [`Forwarder`]
//! (copied to a local upstream).  No public port is ever bound locally.
//!
//! ```no_run
//! use ngrok_agent::{Agent, EndpointConfig, Upstream};
//!
//! # async fn example() -> Result<(), ngrok_agent::Error> {
//! let agent = Agent::builder().authtoken_from_env().build();
//! let endpoint = agent
//!     .forward(EndpointConfig::new(), Upstream::new("localhost:8080"))
//!     .await?;
//! println!("serving at {}", endpoint.url());
//! endpoint.done().await;
//! # Ok(())
//! # }
//! ```

mod agent;
mod config;
mod dial;
mod endpoint;
mod errors;
mod events;
mod probe;
mod proxy_proto;
mod session;
mod shutdown;
mod tls;

pub use agent::{Agent, AgentBuilder};
pub use config::{
    AUTHTOKEN_ENV_VAR, CommandHandler, DEFAULT_SERVER_ADDR, EndpointConfig, ProxyProto,
    RemoteCommand, Upstream, authtoken_from_env,
};
pub use dial::{Dialer, IoStream, TcpDialer};
pub use endpoint::{Conn, EndpointInfo, Forwarder, Listener};
pub use errors::Error;
pub use events::{Event, EventHandler};
pub use na_protocol::RemoteError;
pub use probe::ProbeResult;
pub use session::Session;
pub use shutdown::{Gate, OpGuard};
pub use tls::TlsCustomizer;
