//! EdgeTurn CLI - reverse-tunnel relay, edge agent and client tools

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgeturn_agent::{AgentConfig, AgentConnector, TcpForwarder};
use edgeturn_client::LocalForwarder;
use edgeturn_lib::{
    generate_self_signed_cert, ClientTlsSettings, Relay, RelayConfig, TlsSettings,
};
use edgeturn_proto::{ExecReqInfo, ExecReqType};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// EdgeTurn - reach edge services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "edgeturn")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "EDGETURN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay (backend listener + client listener)
    #[command(long_about = r#"
Run the EdgeTurn relay. Edge agents dial the backend listener and receive a
session token; clients present that token on the client listener.

EXAMPLES:
  # Relay with TLS on both listeners
  edgeturn relay --listen-addr 0.0.0.0:6080 --proxy-addr 0.0.0.0:8443 \
    --tls-cert relay.pem --tls-key relay-key.pem

  # Behind a load balancer terminating on 443
  edgeturn relay --tls-cert relay.pem --tls-key relay-key.pem --access-port 443
    "#)]
    Relay(RelayArgs),

    /// Open a session on a relay and forward its streams to a local service
    Agent(AgentArgs),

    /// Expose a shell session as a local TCP port
    Forward(ForwardArgs),

    /// Generate a self-signed certificate for development
    GenerateCert {
        /// Subject alternative names
        #[arg(long = "name", default_value = "localhost")]
        names: Vec<String>,

        /// Directory receiving cert.pem and key.pem
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Backend listener address (agents)
    #[arg(long, env = "EDGETURN_LISTEN_ADDR", default_value = "127.0.0.1:6080")]
    listen_addr: SocketAddr,

    /// Client listener address (end users)
    #[arg(long, env = "EDGETURN_PROXY_ADDR", default_value = "127.0.0.1:8443")]
    proxy_addr: SocketAddr,

    /// Backend listener certificate (PEM)
    #[arg(long, env = "EDGETURN_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Backend listener private key (PEM)
    #[arg(long, env = "EDGETURN_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Require agent certificates signed by this CA (PEM)
    #[arg(long, env = "EDGETURN_CLIENT_CA", requires = "tls_cert")]
    client_ca: Option<PathBuf>,

    /// Client listener certificate; defaults to --tls-cert
    #[arg(long, env = "EDGETURN_PROXY_TLS_CERT", requires = "proxy_tls_key")]
    proxy_tls_cert: Option<PathBuf>,

    /// Client listener private key; defaults to --tls-key
    #[arg(long, env = "EDGETURN_PROXY_TLS_KEY", requires = "proxy_tls_cert")]
    proxy_tls_key: Option<PathBuf>,

    /// Port advertised to agents; defaults to the client listener port
    #[arg(long, env = "EDGETURN_ACCESS_PORT")]
    access_port: Option<String>,

    /// Seconds allowed for an agent's TLS handshake and session request
    #[arg(long, env = "EDGETURN_HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout: u64,

    /// Seconds a shell session may wait for its client
    #[arg(long, env = "EDGETURN_SHELL_CLAIM_TIMEOUT", default_value = "300")]
    shell_claim_timeout: u64,

    /// Lifetime of a console session in seconds
    #[arg(long, env = "EDGETURN_CONSOLE_TTL", default_value = "1200")]
    console_ttl: u64,

    /// Seconds between keepalive pings to agents (0 disables)
    #[arg(long, env = "EDGETURN_KEEPALIVE_INTERVAL", default_value = "30")]
    keepalive_interval: u64,

    /// Maximum concurrent sessions (unlimited when unset)
    #[arg(long, env = "EDGETURN_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Maximum concurrent client links
    #[arg(long, env = "EDGETURN_MAX_LINKS", default_value = "1024")]
    max_links: usize,
}

#[derive(Args, Debug)]
struct ClientTlsArgs {
    /// Trust this CA instead of the public web roots
    #[arg(long, env = "EDGETURN_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

impl ClientTlsArgs {
    fn settings(&self) -> ClientTlsSettings {
        let mut settings = ClientTlsSettings::default();
        if let Some(ca) = &self.ca_cert {
            settings = settings.with_ca_cert(ca);
        }
        if self.insecure {
            warn!("⚠️  Certificate verification disabled (insecure mode)");
            settings = settings.with_insecure_skip_verify();
        }
        settings
    }
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay backend listener, host:port
    #[arg(long, env = "EDGETURN_RELAY")]
    relay: String,

    /// Session type: shell, console, logs or access-cloudlet
    #[arg(long, default_value = "shell")]
    kind: ExecReqType,

    /// Console landing URL (console sessions)
    #[arg(long, required_if_eq("kind", "console"))]
    init_url: Option<Url>,

    /// Local service each client stream is forwarded to
    #[arg(long, env = "EDGETURN_TARGET")]
    target: String,

    /// Dial the relay without TLS
    #[arg(long)]
    plaintext: bool,

    /// Name expected in the relay certificate
    #[arg(long)]
    server_name: Option<String>,

    /// Host clients use to reach the relay, for the printed access URL
    #[arg(long)]
    public_host: Option<String>,

    /// Certificate presented to relays requiring client auth
    #[arg(long, requires = "client_key")]
    client_cert: Option<PathBuf>,

    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    #[command(flatten)]
    tls: ClientTlsArgs,
}

#[derive(Args, Debug)]
struct ForwardArgs {
    /// Shell URL printed by the agent (wss://host:port/edgeshell?edgetoken=...)
    #[arg(long)]
    url: String,

    /// Local address to listen on
    #[arg(long, default_value = "127.0.0.1:2222")]
    listen: SocketAddr,

    #[command(flatten)]
    tls: ClientTlsArgs,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!("Error listening for shutdown signal: {}", e),
        }
        token.cancel();
    });
}

fn relay_config(args: RelayArgs) -> RelayConfig {
    let mut config = RelayConfig::default()
        .with_listen_addr(args.listen_addr)
        .with_proxy_addr(args.proxy_addr)
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout))
        .with_shell_claim_timeout(Duration::from_secs(args.shell_claim_timeout))
        .with_console_ttl(Duration::from_secs(args.console_ttl))
        .with_keepalive_interval(
            (args.keepalive_interval > 0).then(|| Duration::from_secs(args.keepalive_interval)),
        )
        .with_max_links(args.max_links);

    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        let mut backend = TlsSettings::new(cert, key);
        if let Some(ca) = &args.client_ca {
            backend = backend.with_client_ca(ca);
        }
        config = config.with_backend_tls(backend);
    }

    let proxy_cert = args.proxy_tls_cert.or(args.tls_cert);
    let proxy_key = args.proxy_tls_key.or(args.tls_key);
    if let (Some(cert), Some(key)) = (proxy_cert, proxy_key) {
        config = config.with_proxy_tls(TlsSettings::new(cert, key));
    }

    if let Some(port) = args.access_port {
        config = config.with_access_port(port);
    }
    if let Some(max) = args.max_sessions {
        config = config.with_max_sessions(max);
    }
    config
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let relay = Relay::bind(relay_config(args))
        .await
        .context("Failed to start relay")?;

    info!("Agents connect to {}", relay.turn_addr());
    info!("Clients connect to {}", relay.proxy_addr());

    cancel_on_ctrl_c(relay.shutdown_token());
    relay.run().await?;

    info!("EdgeTurn relay stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let mut config = AgentConfig::new(args.relay.clone());
    if !args.plaintext {
        let mut tls = args.tls.settings();
        if let (Some(cert), Some(key)) = (&args.client_cert, &args.client_key) {
            tls = tls.with_client_cert(cert, key);
        }
        config = config.with_tls(tls);
    } else {
        warn!("Dialing relay {} WITHOUT TLS", args.relay);
    }
    if let Some(name) = args.server_name {
        config = config.with_server_name(name);
    }
    if let Some(host) = args.public_host {
        config = config.with_public_host(host);
    }

    let request = ExecReqInfo {
        kind: args.kind,
        init_url: args.init_url,
    };
    let session = AgentConnector::new(config)
        .connect(request)
        .await
        .with_context(|| format!("Failed to open session on {}", args.relay))?;

    if args.kind == ExecReqType::Console {
        info!("Console URL: {}", session.console_url());
    } else {
        info!("Shell URL: {}", session.shell_url());
    }

    let forwarder = TcpForwarder::new(args.target);
    tokio::select! {
        _ = forwarder.serve(&session) => info!("Relay ended the session"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, closing session...");
            session.close("agent stopped");
        }
    }
    Ok(())
}

async fn run_forward(args: ForwardArgs) -> Result<()> {
    let forwarder = LocalForwarder::bind(args.listen, args.url, args.tls.settings())
        .await
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    info!("Listening on {}", forwarder.local_addr()?);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    forwarder.run(shutdown).await?;
    Ok(())
}

fn generate_cert(names: Vec<String>, out_dir: PathBuf) -> Result<()> {
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let cert = generate_self_signed_cert(&names).context("Failed to generate certificate")?;
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let (cert_path, key_path) = cert
        .save_to_dir(&out_dir)
        .context("Failed to write certificate")?;

    info!("Certificate: {}", cert_path.display());
    info!("Private key: {}", key_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Forward(args) => run_forward(args).await,
        Commands::GenerateCert { names, out_dir } => generate_cert(names, out_dir),
    }
}
