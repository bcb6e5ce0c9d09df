//! Edge agent side of EdgeTurn
//!
//! An agent dials the relay's backend listener, asks for a session, and then
//! serves every stream the relay opens on behalf of a client, typically by
//! forwarding it to a local service.

pub mod connector;
pub mod forwarder;

pub use connector::{AgentConfig, AgentConnector, AgentSession};
pub use forwarder::TcpForwarder;

use edgeturn_cert::CertError;
use edgeturn_mux::MuxError;
use edgeturn_proto::HandshakeError;
use std::time::Duration;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to relay at {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] CertError),

    #[error("TLS handshake with relay failed: {0}")]
    TlsHandshake(std::io::Error),

    #[error("Session handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Relay did not answer within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Session error: {0}")]
    Session(#[from] MuxError),
}
