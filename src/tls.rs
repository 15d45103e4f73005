use std::sync::Arc;

use anyhow::Result;
use base64::prelude::*;

use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{
        ClientConfig, RootCertStore, ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        server::WebPkiClientVerifier,
    },
};

/// The relay's two TLS roles over one identity.
///
/// Every session in the overlay is mutually authenticated against the
/// cluster authority: inbound peers and clients are verified by the
/// acceptor, outbound peer dials present the same certificate through the
/// connector.
pub struct Identity {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl Identity {
    /// Build both roles from the base64-encoded PEM material passed on the
    /// command line.
    pub fn new(cert: &str, key: &str, ca: &str) -> Result<Self> {
        let cert_pem = BASE64_STANDARD.decode(cert)?;
        let key_pem = BASE64_STANDARD.decode(key)?;
        let ca_pem = BASE64_STANDARD.decode(ca)?;

        let certs = CertificateDer::pem_slice_iter(&cert_pem).collect::<Result<Vec<_>, _>>()?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem)?;

        let mut roots = RootCertStore::empty();
        for root in CertificateDer::pem_slice_iter(&ca_pem) {
            roots.add(root?)?;
        }
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder(roots.clone()).build()?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())?;

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }
}
