//! Dialing the relay and establishing a session

use edgeturn_cert::ClientTlsSettings;
use edgeturn_mux::{MuxConfig, MuxError, MuxRole, MuxSession, MuxStream};
use edgeturn_proto::{
    read_line, write_line, ExecReqInfo, SessionInfo, CONSOLE_PATH, MAX_HANDSHAKE_LINE,
    SHELL_PATH, TOKEN_PARAM,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::AgentError;

/// How an agent reaches the relay
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend listener address, `host:port`
    pub relay_addr: String,
    /// TLS towards the relay; `None` dials plaintext
    pub tls: Option<ClientTlsSettings>,
    /// Name checked against the relay certificate (defaults to the relay host)
    pub server_name: Option<String>,
    /// Host clients use to reach the relay (defaults to the relay host)
    pub public_host: Option<String>,
    /// Bound on connect, TLS handshake and session reply
    pub handshake_timeout: Duration,
    pub mux: MuxConfig,
}

impl AgentConfig {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            tls: None,
            server_name: None,
            public_host: None,
            handshake_timeout: Duration::from_secs(10),
            mux: MuxConfig::default(),
        }
    }

    pub fn with_tls(mut self, tls: ClientTlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    fn relay_host(&self) -> Result<&str, AgentError> {
        self.relay_addr
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| !host.is_empty())
            .ok_or_else(|| AgentError::InvalidAddress(self.relay_addr.clone()))
    }
}

/// Opens sessions on a relay
#[derive(Debug, Clone)]
pub struct AgentConnector {
    config: AgentConfig,
}

impl AgentConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Ask the relay for a session of the requested kind
    pub async fn connect(&self, request: ExecReqInfo) -> Result<AgentSession, AgentError> {
        let config = &self.config;
        let relay_host = config.relay_host()?.to_string();

        tokio::time::timeout(config.handshake_timeout, async {
            let tcp = TcpStream::connect(&config.relay_addr).await.map_err(|e| {
                AgentError::ConnectionFailed {
                    address: config.relay_addr.clone(),
                    source: e,
                }
            })?;
            let _ = tcp.set_nodelay(true);
            debug!("Connected to relay at {}", config.relay_addr);

            match &config.tls {
                Some(tls) => {
                    let client_config = tls.client_config()?;
                    let name = config.server_name.as_deref().unwrap_or(&relay_host);
                    let server_name = ServerName::try_from(name.to_string())
                        .map_err(|_| AgentError::InvalidAddress(name.to_string()))?;
                    let stream = TlsConnector::from(Arc::new(client_config))
                        .connect(server_name, tcp)
                        .await
                        .map_err(AgentError::TlsHandshake)?;
                    self.establish(stream, &request, relay_host.clone()).await
                }
                None => self.establish(tcp, &request, relay_host.clone()).await,
            }
        })
        .await
        .map_err(|_| AgentError::HandshakeTimeout(config.handshake_timeout))?
    }

    async fn establish<T>(
        &self,
        mut stream: T,
        request: &ExecReqInfo,
        relay_host: String,
    ) -> Result<AgentSession, AgentError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        write_line(&mut stream, request).await?;

        let mut reader = BufReader::new(stream);
        let info: SessionInfo = read_line(&mut reader, MAX_HANDSHAKE_LINE).await?;

        // Frames may already sit in the reader's buffer behind the reply
        let (mux, driver) = MuxSession::new(reader, MuxRole::Server, self.config.mux.clone());
        driver.spawn();

        let public_host = self
            .config
            .public_host
            .clone()
            .unwrap_or(relay_host);

        info!(
            "{} session established on relay {} (access port {})",
            request.kind, self.config.relay_addr, info.access_port
        );

        Ok(AgentSession {
            info,
            public_host,
            mux,
        })
    }
}

/// A live session on the relay
#[derive(Debug, Clone)]
pub struct AgentSession {
    info: SessionInfo,
    public_host: String,
    mux: MuxSession,
}

impl AgentSession {
    pub fn token(&self) -> &str {
        &self.info.token
    }

    pub fn access_port(&self) -> &str {
        &self.info.access_port
    }

    /// WebSocket URL a client attaches to a shell-like session with
    pub fn shell_url(&self) -> String {
        format!(
            "wss://{}:{}{}?{}={}",
            self.public_host,
            self.info.access_port,
            SHELL_PATH,
            TOKEN_PARAM,
            self.info.token
        )
    }

    /// Browser entry point of a console session
    pub fn console_url(&self) -> String {
        format!(
            "https://{}:{}{}?{}={}",
            self.public_host,
            self.info.access_port,
            CONSOLE_PATH,
            TOKEN_PARAM,
            self.info.token
        )
    }

    /// Next stream opened by the relay for a client
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        self.mux.accept_stream().await
    }

    pub fn close(&self, reason: &str) {
        self.mux.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolves once the session is gone
    pub async fn closed(&self) {
        self.mux.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_host() {
        assert_eq!(
            AgentConfig::new("relay.example.com:6080").relay_host().unwrap(),
            "relay.example.com"
        );
        assert_eq!(AgentConfig::new("[::1]:6080").relay_host().unwrap(), "::1");
        assert!(AgentConfig::new("no-port").relay_host().is_err());
    }

    #[tokio::test]
    async fn test_access_urls() {
        let (io, _peer) = tokio::io::duplex(1024);
        let (mux, _driver) = MuxSession::new(io, MuxRole::Server, MuxConfig::default());
        let session = AgentSession {
            info: SessionInfo {
                token: "abc".to_string(),
                access_port: "8443".to_string(),
            },
            public_host: "relay.example.com".to_string(),
            mux,
        };

        assert_eq!(
            session.shell_url(),
            "wss://relay.example.com:8443/edgeshell?edgetoken=abc"
        );
        assert_eq!(
            session.console_url(),
            "https://relay.example.com:8443/edgeconsole?edgetoken=abc"
        );
    }
}
