// rustls configuration for relay links.
//
// The relay terminates TLS itself when given a PEM certificate chain and
// private key (`ServerCredentials`); clients verify it against a PEM root
// bundle read fresh on every connection attempt. Both sides use the ring
// provider explicitly rather than relying on a process-wide default, so an
// embedding host that installs a different provider is unaffected.
//
// Only configuration lives here. The handshake and record I/O run on each
// link's pump thread (see `link.rs`).

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::RelayError;

/// PEM material for the relay's TLS listener.
#[derive(Clone)]
pub struct ServerCredentials {
    pub certificate_chain_pem: String,
    pub private_key_pem: String,
}

impl ServerCredentials {
    pub fn new(certificate_chain_pem: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            certificate_chain_pem: certificate_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    pub fn from_pem_files(certificate_chain: &Path, private_key: &Path) -> Result<Self, RelayError> {
        Ok(Self::new(
            fs::read_to_string(certificate_chain)?,
            fs::read_to_string(private_key)?,
        ))
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("certificate_chain_pem", &self.certificate_chain_pem.len())
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the listener-side config.
pub fn server_config(credentials: &ServerCredentials) -> Result<Arc<ServerConfig>, RelayError> {
    let certs = CertificateDer::pem_slice_iter(credentials.certificate_chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Credentials(format!("certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::Credentials(
            "certificate chain contains no certificates".into(),
        ));
    }
    let key = PrivateKeyDer::from_pem_slice(credentials.private_key_pem.as_bytes())
        .map_err(|e| RelayError::Credentials(format!("private key: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build a client config trusting every certificate in `root_pem`.
pub fn client_config(root_pem: &str) -> Result<Arc<ClientConfig>, RelayError> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(root_pem.as_bytes()) {
        let cert = cert.map_err(|e| RelayError::Credentials(format!("root certificate: {e}")))?;
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(RelayError::Credentials("root bundle contains no certificates".into()));
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Name the client verifies the relay's certificate against.
pub fn server_name(host: &str) -> Result<ServerName<'static>, RelayError> {
    ServerName::try_from(host.to_owned()).map_err(|_| RelayError::Endpoint(host.to_owned()))
}
