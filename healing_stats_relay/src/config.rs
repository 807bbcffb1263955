// Relay server configuration.
//
// `RelayConfig` can be built in code (tests, embedding) or loaded from a
// JSON file by the relay binary, with command-line flags layered on top
// (see `main.rs`). Every field has a default, so a config file only needs
// the keys it changes:
//
//   { "listen": "0.0.0.0:443",
//     "certificate_chain": "/etc/relay/fullchain.pem",
//     "private_key": "/etc/relay/privkey.pem" }
//
// TLS material comes either from those two paths or, for in-process use,
// from `credentials` directly. Without either the relay speaks plaintext.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RelayError;
use crate::tls::ServerCredentials;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Listening endpoint, `host:port`. Port 0 picks a free port.
    pub listen: String,
    /// PEM certificate chain path.
    pub certificate_chain: Option<PathBuf>,
    /// PEM private key path.
    pub private_key: Option<PathBuf>,
    /// How often the relay binary logs statistics; 0 disables.
    pub stats_interval_secs: u64,
    /// In-memory credentials. Take precedence over the PEM paths.
    #[serde(skip)]
    pub credentials: Option<ServerCredentials>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:50051".into(),
            certificate_chain: None,
            private_key: None,
            stats_interval_secs: 60,
            credentials: None,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, RelayError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// TLS credentials to serve with, if any.
    pub fn resolve_credentials(&self) -> Result<Option<ServerCredentials>, RelayError> {
        if let Some(credentials) = &self.credentials {
            return Ok(Some(credentials.clone()));
        }
        match (&self.certificate_chain, &self.private_key) {
            (Some(chain), Some(key)) => Ok(Some(ServerCredentials::from_pem_files(chain, key)?)),
            (None, None) => Ok(None),
            _ => Err(RelayError::Config(
                "certificate_chain and private_key must be set together".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RelayConfig::from_json_str(r#"{ "listen": "0.0.0.0:9000" }"#).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.stats_interval_secs, 60);
        assert!(config.resolve_credentials().unwrap().is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RelayConfig::from_json_str(r#"{ "port": 9000 }"#).unwrap_err();
        assert!(matches!(err, RelayError::ConfigParse(_)));
    }

    #[test]
    fn half_configured_tls_is_an_error() {
        let config = RelayConfig {
            certificate_chain: Some("chain.pem".into()),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.resolve_credentials(),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn in_memory_credentials_win() {
        let config = RelayConfig {
            certificate_chain: Some("missing.pem".into()),
            credentials: Some(ServerCredentials::new("chain", "key")),
            ..RelayConfig::default()
        };
        let credentials = config.resolve_credentials().unwrap().unwrap();
        assert_eq!(credentials.certificate_chain_pem, "chain");
    }
}
