//! Throwaway TLS material for tests.

use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// One self-signed certificate plus its key.
pub struct TestCert {
    pub cert: CertificateDer<'static>,
    key_pkcs8: Vec<u8>,
}

impl TestCert {
    /// Generate a fresh self-signed certificate for the given names.
    /// Strings that parse as IP addresses become IP SANs.
    pub fn generate(subject_alt_names: &[&str]) -> TestCert {
        let key = KeyPair::generate().expect("generate key pair");
        let params = CertificateParams::new(
            subject_alt_names
                .iter()
                .map(|s| (*s).to_owned())
                .collect::<Vec<_>>(),
        )
        .expect("certificate params");
        let cert = params.self_signed(&key).expect("self-sign certificate");
        TestCert {
            cert: cert.der().clone().into_owned(),
            key_pkcs8: key.serialize_der(),
        }
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }

    /// Server config presenting this certificate.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![self.cert.clone()], self.key())
        .expect("server config");
        Arc::new(config)
    }

    /// Root store trusting exactly this certificate.
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).expect("add test root");
        roots
    }

    /// Client config trusting exactly this certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_root_certificates(self.root_store())
        .with_no_client_auth();
        Arc::new(config)
    }
}
