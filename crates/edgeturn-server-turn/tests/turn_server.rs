//! Backend listener tests: handshake, registration and cleanup

use edgeturn_cert::{generate_self_signed_cert, ClientTlsSettings, TlsSettings};
use edgeturn_control::SessionRegistry;
use edgeturn_proto::{read_line, write_line, ExecReqInfo, SessionInfo, MAX_HANDSHAKE_LINE};
use edgeturn_server_turn::{TurnServer, TurnServerConfig};
use edgeturn_transport::StreamAcceptor;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgeturn=debug")
        .with_test_writer()
        .try_init();
}

fn test_config() -> TurnServerConfig {
    TurnServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        access_port: "8443".to_string(),
        ..TurnServerConfig::default()
    }
}

async fn start(
    config: TurnServerConfig,
    acceptor: StreamAcceptor,
) -> (SocketAddr, Arc<SessionRegistry>, CancellationToken) {
    let registry = Arc::new(SessionRegistry::new());
    let server = TurnServer::bind(config, acceptor, registry.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, registry, shutdown)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_tls_shell_handshake_registers_session() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cert = generate_self_signed_cert(&["localhost"]).unwrap();
    let (cert_path, key_path) = cert.save_to_dir(dir.path()).unwrap();

    let server_tls = TlsSettings::new(&cert_path, &key_path)
        .server_config()
        .unwrap();
    let (addr, registry, _shutdown) =
        start(test_config(), StreamAcceptor::tls(Arc::new(server_tls))).await;

    let client_tls = ClientTlsSettings::default()
        .with_ca_cert(&cert_path)
        .client_config()
        .unwrap();
    let connector = TlsConnector::from(Arc::new(client_tls));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    write_line(&mut tls, &ExecReqInfo::shell()).await.unwrap();
    let mut reader = BufReader::new(tls);
    let info: SessionInfo = read_line(&mut reader, MAX_HANDSHAKE_LINE).await.unwrap();

    assert_eq!(info.access_port, "8443");
    assert!(!info.token.is_empty());
    assert!(registry.contains(&info.token));

    // Backend goes away: the session leaves the registry
    drop(reader);
    wait_until(|| !registry.contains(&info.token)).await;
}

/// Writes a CA plus an agent certificate it signed; returns (ca, agent cert, agent key)
fn write_agent_ca(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "EdgeTurn Test Agent CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let mut agent_params = CertificateParams::new(vec!["edge-agent".to_string()]).unwrap();
    agent_params
        .distinguished_name
        .push(DnType::CommonName, "edge-agent");
    agent_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let agent_key = KeyPair::generate().unwrap();
    let agent = agent_params.signed_by(&agent_key, &ca, &ca_key).unwrap();

    let ca_path = dir.join("agent-ca.pem");
    let cert_path = dir.join("agent.pem");
    let key_path = dir.join("agent.key");
    std::fs::write(&ca_path, ca.pem()).unwrap();
    std::fs::write(&cert_path, agent.pem()).unwrap();
    std::fs::write(&key_path, agent_key.serialize_pem()).unwrap();
    (ca_path, cert_path, key_path)
}

async fn start_mutual_tls(dir: &Path) -> (SocketAddr, Arc<SessionRegistry>, PathBuf, PathBuf, PathBuf) {
    let server_cert = generate_self_signed_cert(&["localhost"]).unwrap();
    let (server_cert_path, server_key_path) = server_cert.save_to_dir(dir).unwrap();
    let (ca_path, agent_cert, agent_key) = write_agent_ca(dir);

    let server_tls = TlsSettings::new(&server_cert_path, &server_key_path)
        .with_client_ca(&ca_path)
        .server_config()
        .unwrap();
    let (addr, registry, _shutdown) =
        start(test_config(), StreamAcceptor::tls(Arc::new(server_tls))).await;
    (addr, registry, server_cert_path, agent_cert, agent_key)
}

/// Full TLS handshake plus request; `None` when the relay refused the agent
async fn tls_handshake(
    addr: SocketAddr,
    client: ClientTlsSettings,
) -> Option<(BufReader<tokio_rustls::client::TlsStream<TcpStream>>, SessionInfo)> {
    let connector = TlsConnector::from(Arc::new(client.client_config().unwrap()));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .ok()?;

    // With TLS 1.3 a refused client certificate surfaces on the first read
    write_line(&mut tls, &ExecReqInfo::shell()).await.ok()?;
    let mut reader = BufReader::new(tls);
    let info: SessionInfo = read_line(&mut reader, MAX_HANDSHAKE_LINE).await.ok()?;
    Some((reader, info))
}

#[tokio::test]
async fn test_mutual_tls_accepts_agent_with_signed_cert() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (addr, registry, server_cert, agent_cert, agent_key) = start_mutual_tls(dir.path()).await;

    let client = ClientTlsSettings::default()
        .with_ca_cert(&server_cert)
        .with_client_cert(&agent_cert, &agent_key);
    let (_backend, info) = tls_handshake(addr, client)
        .await
        .expect("agent with a CA-signed certificate was refused");

    assert!(registry.contains(&info.token));
}

#[tokio::test]
async fn test_mutual_tls_refuses_agent_without_cert() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (addr, registry, server_cert, _agent_cert, _agent_key) =
        start_mutual_tls(dir.path()).await;

    let client = ClientTlsSettings::default().with_ca_cert(&server_cert);
    let outcome = tokio::time::timeout(Duration::from_secs(5), tls_handshake(addr, client))
        .await
        .expect("refused agent was left hanging");

    assert!(outcome.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_mutual_tls_refuses_cert_from_other_issuer() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (addr, registry, server_cert, _agent_cert, _agent_key) =
        start_mutual_tls(dir.path()).await;

    let other = tempfile::tempdir().unwrap();
    let (_other_ca, stray_cert, stray_key) = write_agent_ca(other.path());
    let client = ClientTlsSettings::default()
        .with_ca_cert(&server_cert)
        .with_client_cert(&stray_cert, &stray_key);
    let outcome = tokio::time::timeout(Duration::from_secs(5), tls_handshake(addr, client))
        .await
        .expect("refused agent was left hanging");

    assert!(outcome.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_malformed_request_registers_nothing() {
    init_tracing();
    let (addr, registry, _shutdown) = start(test_config(), StreamAcceptor::Plain).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"{\"Type\":\"teleport\"}\n").await.unwrap();

    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "no reply expected for a rejected handshake");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_console_without_init_url_rejected() {
    init_tracing();
    let (addr, registry, _shutdown) = start(test_config(), StreamAcceptor::Plain).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"{\"Type\":\"console\"}\n").await.unwrap();

    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_stalled_handshake_times_out() {
    init_tracing();
    let config = TurnServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (addr, registry, _shutdown) = start(config, StreamAcceptor::Plain).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Half a request, then silence
    stream.write_all(b"{\"Type\":").await.unwrap();

    let mut buf = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    assert!(closed.is_ok(), "server kept a stalled handshake open");
    assert!(registry.is_empty());
}

// ============================================================================
// Session lifetime
// ============================================================================

async fn plain_handshake(addr: SocketAddr, request: &ExecReqInfo) -> (BufReader<TcpStream>, SessionInfo) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_line(&mut stream, request).await.unwrap();
    let mut reader = BufReader::new(stream);
    let info: SessionInfo = read_line(&mut reader, MAX_HANDSHAKE_LINE).await.unwrap();
    (reader, info)
}

#[tokio::test]
async fn test_unclaimed_shell_session_expires() {
    init_tracing();
    let config = TurnServerConfig {
        shell_claim_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (addr, registry, _shutdown) = start(config, StreamAcceptor::Plain).await;

    let (mut backend, info) = plain_handshake(addr, &ExecReqInfo::shell()).await;
    assert!(registry.contains(&info.token));

    wait_until(|| !registry.contains(&info.token)).await;

    // The backend connection is closed along with the session
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), backend.read_to_end(&mut buf)).await;
    assert!(read.is_ok());
}

#[tokio::test]
async fn test_console_session_ttl() {
    init_tracing();
    let config = TurnServerConfig {
        console_ttl: Duration::from_millis(300),
        ..test_config()
    };
    let (addr, registry, _shutdown) = start(config, StreamAcceptor::Plain).await;

    let request = ExecReqInfo::console("http://127.0.0.1:6080/vnc.html".parse().unwrap());
    let (_backend, info) = plain_handshake(addr, &request).await;
    assert!(registry.contains(&info.token));

    wait_until(|| !registry.contains(&info.token)).await;
}

#[tokio::test]
async fn test_tokens_differ_per_backend() {
    init_tracing();
    let (addr, registry, _shutdown) = start(test_config(), StreamAcceptor::Plain).await;

    let (_a, first) = plain_handshake(addr, &ExecReqInfo::shell()).await;
    let (_b, second) = plain_handshake(addr, &ExecReqInfo::shell()).await;

    assert_ne!(first.token, second.token);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    init_tracing();
    let (addr, registry, shutdown) = start(test_config(), StreamAcceptor::Plain).await;

    let (_backend, info) = plain_handshake(addr, &ExecReqInfo::shell()).await;
    assert!(registry.contains(&info.token));

    shutdown.cancel();
    wait_until(|| registry.is_empty()).await;
}
