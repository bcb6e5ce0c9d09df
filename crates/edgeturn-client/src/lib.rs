//! End-user side of EdgeTurn
//!
//! [`connect_shell`] attaches to a shell-like session through the relay's
//! client listener. [`LocalForwarder`] exposes such a session as a local
//! TCP port so ordinary tools (ssh, nc, a terminal) can use it.

pub mod forwarder;
pub mod shell;

pub use forwarder::LocalForwarder;
pub use shell::{connect_shell, ShellClient, ShellReader, ShellWriter};

use edgeturn_cert::CertError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Relay refused the session (HTTP {0})")]
    Refused(u16),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] CertError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the relay rejected the token (unknown, expired or in use)
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Refused(401))
    }
}
