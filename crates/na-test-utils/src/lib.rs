// na-test-utils: Shared test support for the agent suite.
//
// Provides an in-process mock ingress server speaking the real TLS +
// multiplex + RPC wire, plus throwaway certificate helpers.

pub mod mock_edge;
pub mod tls;

pub use mock_edge::{BoundEndpoint, EdgeSession, MockEdge};
pub use tls::TestCert;
