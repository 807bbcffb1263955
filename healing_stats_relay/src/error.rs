// Setup-time errors for the relay server and client transport.
//
// Connection-level failures never surface here: once a relay is running,
// protocol violations and registration conflicts end only the offending
// connection (see `server.rs`), and transport failures on the client side
// are retried on the reconnect interval (see `client.rs`). `RelayError`
// covers what can go wrong before that point, mostly bad configuration or
// PEM material and a listener that cannot bind.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("invalid endpoint {0:?}")]
    Endpoint(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
