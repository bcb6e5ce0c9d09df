//! The relay process: both listeners around one session registry

use edgeturn_cert::{CertError, TlsSettings};
use edgeturn_control::SessionRegistry;
use edgeturn_mux::MuxConfig;
use edgeturn_server_proxy::{ProxyServer, ProxyServerConfig, ProxyServerError};
use edgeturn_server_turn::{TurnServer, TurnServerConfig, TurnServerError};
use edgeturn_transport::StreamAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("TLS configuration error: {0}")]
    Tls(#[from] CertError),

    #[error("Backend listener error: {0}")]
    Turn(#[from] TurnServerError),

    #[error("Client listener error: {0}")]
    Proxy(#[from] ProxyServerError),

    #[error("Listener task failed: {0}")]
    Task(String),
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Backend listener agents dial
    pub listen_addr: SocketAddr,
    /// Client listener end users connect to
    pub proxy_addr: SocketAddr,
    /// Backend listener TLS; plaintext when unset
    pub backend_tls: Option<TlsSettings>,
    /// Client listener TLS; plaintext when unset
    pub proxy_tls: Option<TlsSettings>,
    /// Port advertised to agents; defaults to the bound client listener port
    pub access_port: Option<String>,
    pub handshake_timeout: Duration,
    pub shell_claim_timeout: Duration,
    pub console_ttl: Duration,
    /// Mux keepalive ping interval; `None` disables keepalive
    pub keepalive_interval: Option<Duration>,
    pub max_sessions: Option<usize>,
    pub max_links: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let turn = TurnServerConfig::default();
        let proxy = ProxyServerConfig::default();
        Self {
            listen_addr: turn.bind_addr,
            proxy_addr: proxy.bind_addr,
            backend_tls: None,
            proxy_tls: None,
            access_port: None,
            handshake_timeout: turn.handshake_timeout,
            shell_claim_timeout: turn.shell_claim_timeout,
            console_ttl: turn.console_ttl,
            keepalive_interval: turn.mux.keepalive_interval,
            max_sessions: None,
            max_links: proxy.max_links,
        }
    }
}

impl RelayConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.proxy_addr = addr;
        self
    }

    pub fn with_backend_tls(mut self, tls: TlsSettings) -> Self {
        self.backend_tls = Some(tls);
        self
    }

    pub fn with_proxy_tls(mut self, tls: TlsSettings) -> Self {
        self.proxy_tls = Some(tls);
        self
    }

    pub fn with_access_port(mut self, port: impl Into<String>) -> Self {
        self.access_port = Some(port.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shell_claim_timeout(mut self, timeout: Duration) -> Self {
        self.shell_claim_timeout = timeout;
        self
    }

    pub fn with_console_ttl(mut self, ttl: Duration) -> Self {
        self.console_ttl = ttl;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    pub fn with_max_links(mut self, max: usize) -> Self {
        self.max_links = max;
        self
    }

    fn mux_config(&self) -> MuxConfig {
        let mux = MuxConfig::default();
        // Three missed pings end the session
        let timeout = self
            .keepalive_interval
            .map(|interval| interval * 3)
            .unwrap_or(mux.keepalive_timeout);
        mux.with_keepalive(self.keepalive_interval, timeout)
    }
}

fn acceptor(tls: Option<&TlsSettings>) -> Result<StreamAcceptor, CertError> {
    match tls {
        Some(settings) => Ok(StreamAcceptor::tls(Arc::new(settings.server_config()?))),
        None => Ok(StreamAcceptor::Plain),
    }
}

/// A bound relay, ready to [`Relay::run`]
pub struct Relay {
    turn: TurnServer,
    proxy: ProxyServer,
    turn_addr: SocketAddr,
    proxy_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Load TLS material and bind both listeners
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let registry = Arc::new(match config.max_sessions {
            Some(max) => SessionRegistry::new().with_max_sessions(max),
            None => SessionRegistry::new(),
        });

        let proxy_config = ProxyServerConfig {
            bind_addr: config.proxy_addr,
            max_links: config.max_links,
            handshake_timeout: config.handshake_timeout,
            ..ProxyServerConfig::default()
        };
        let proxy = ProxyServer::bind(
            proxy_config,
            acceptor(config.proxy_tls.as_ref())?,
            registry.clone(),
        )
        .await?;
        let proxy_addr = proxy.local_addr()?;

        let access_port = config
            .access_port
            .clone()
            .unwrap_or_else(|| proxy_addr.port().to_string());

        let turn_config = TurnServerConfig {
            bind_addr: config.listen_addr,
            access_port,
            handshake_timeout: config.handshake_timeout,
            shell_claim_timeout: config.shell_claim_timeout,
            console_ttl: config.console_ttl,
            mux: config.mux_config(),
        };
        let turn = TurnServer::bind(
            turn_config,
            acceptor(config.backend_tls.as_ref())?,
            registry.clone(),
        )
        .await?;
        let turn_addr = turn.local_addr()?;

        Ok(Self {
            turn,
            proxy,
            turn_addr,
            proxy_addr,
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address agents dial
    pub fn turn_addr(&self) -> SocketAddr {
        self.turn_addr
    }

    /// Address clients connect to
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Cancelling this token stops the relay
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires or a listener fails
    pub async fn run(self) -> Result<(), RelayError> {
        info!(
            "EdgeTurn relay running: agents on {}, clients on {}",
            self.turn_addr, self.proxy_addr
        );

        let mut join_set: JoinSet<Result<(), RelayError>> = JoinSet::new();
        let shutdown = self.shutdown.clone();

        let turn_shutdown = shutdown.clone();
        let turn = self.turn;
        join_set.spawn(async move { Ok(turn.run(turn_shutdown).await?) });

        let proxy_shutdown = shutdown.clone();
        let proxy = self.proxy;
        join_set.spawn(async move { Ok(proxy.run(proxy_shutdown).await?) });

        let mut result = Ok(());
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.map_err(|e| RelayError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = outcome {
                error!("Relay listener stopped: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            // Either listener ending takes the other one down
            shutdown.cancel();
        }

        self.registry.close_all("relay shutting down");
        info!(
            "EdgeTurn relay stopped ({} sessions still draining)",
            self.registry.len()
        );
        result
    }
}
