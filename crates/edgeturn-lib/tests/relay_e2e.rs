//! End-to-end: agent, relay and client over real sockets

use edgeturn_agent::{AgentConfig, AgentConnector, AgentError, AgentSession};
use edgeturn_client::{connect_shell, ClientError};
use edgeturn_lib::{
    generate_self_signed_cert, ClientTlsSettings, ExecReqInfo, ExecReqType, Relay, RelayConfig,
    SessionRegistry, TlsSettings,
};
use edgeturn_transport::{DuplexStream, StreamRecv, StreamSend};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgeturn=debug")
        .with_test_writer()
        .try_init();
}

struct TestRelay {
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    turn_addr: String,
    proxy_port: u16,
    ca_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cert = generate_self_signed_cert(&["localhost"]).unwrap();
        let (cert_path, key_path) = cert.save_to_dir(dir.path()).unwrap();
        let tls = TlsSettings::new(&cert_path, &key_path);

        let config = config
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_proxy_addr("127.0.0.1:0".parse().unwrap())
            .with_backend_tls(tls.clone())
            .with_proxy_tls(tls);
        let relay = Relay::bind(config).await.unwrap();

        let started = Self {
            registry: relay.registry(),
            shutdown: relay.shutdown_token(),
            turn_addr: relay.turn_addr().to_string(),
            proxy_port: relay.proxy_addr().port(),
            ca_path: cert_path,
            _dir: dir,
        };
        tokio::spawn(relay.run());
        started
    }

    fn client_tls(&self) -> ClientTlsSettings {
        ClientTlsSettings::default().with_ca_cert(&self.ca_path)
    }

    async fn agent(&self, request: ExecReqInfo) -> Result<AgentSession, AgentError> {
        let config = AgentConfig::new(self.turn_addr.clone())
            .with_tls(self.client_tls())
            .with_server_name("localhost")
            .with_public_host("localhost");
        AgentConnector::new(config).connect(request).await
    }

    async fn wait_unregistered(&self, token: &str) {
        for _ in 0..100 {
            if !self.registry.contains(token) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session {} still registered", token);
    }
}

/// Agent that answers every stream with `<name>:<input>`
fn spawn_tagging_agent(session: AgentSession, name: &'static str) {
    tokio::spawn(async move {
        while let Ok(mut stream) = session.accept_stream().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut reply = format!("{}:", name).into_bytes();
                    reply.extend_from_slice(&buf[..n]);
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_shell_session_end_to_end() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    let agent = relay.agent(ExecReqInfo::shell()).await.unwrap();
    assert_eq!(agent.access_port(), relay.proxy_port.to_string());
    assert!(relay.registry.contains(agent.token()));

    let accept = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.accept_stream().await.unwrap() })
    };

    let shell = connect_shell(&agent.shell_url(), &relay.client_tls())
        .await
        .unwrap();
    let (mut rx, mut tx) = shell.split();
    let mut backend = accept.await.unwrap();

    tx.send_bytes("test msg1".into()).await.unwrap();
    let mut buf = [0u8; 9];
    backend.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"test msg1");

    backend.write_all(b"test msg2").await.unwrap();
    let mut received = Vec::new();
    while received.len() < 9 {
        let chunk = rx.recv_bytes(1024).await.unwrap().unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"test msg2");

    // Client leaves: backend connection closed, token forgotten
    tx.finish().await.unwrap();
    drop(rx);
    relay.wait_unregistered(agent.token()).await;
    tokio::time::timeout(Duration::from_secs(5), agent.closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bad_handshake_registers_nothing() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    // Plaintext garbage on a TLS listener
    let mut socket = TcpStream::connect(&relay.turn_addr).await.unwrap();
    socket.write_all(b"{\"Type\":\"shell\"}\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut buf)).await;
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    let url = format!(
        "wss://localhost:{}/edgeshell?edgetoken=definitely-not-issued",
        relay.proxy_port
    );
    let err = connect_shell(&url, &relay.client_tls()).await.err().unwrap();
    assert!(err.is_unauthorized(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    let alpha = relay.agent(ExecReqInfo::shell()).await.unwrap();
    let beta = relay.agent(ExecReqInfo::shell()).await.unwrap();
    assert_ne!(alpha.token(), beta.token());
    spawn_tagging_agent(alpha.clone(), "alpha");
    spawn_tagging_agent(beta.clone(), "beta");

    // Links stay open so both sessions carry traffic at the same time
    let mut links = Vec::new();
    for (session, tag) in [(&alpha, "alpha:"), (&beta, "beta:")] {
        let shell = connect_shell(&session.shell_url(), &relay.client_tls())
            .await
            .unwrap();
        let (mut rx, mut tx) = shell.split();
        tx.send_bytes("ping".into()).await.unwrap();

        let mut received = Vec::new();
        let expected = format!("{}ping", tag);
        while received.len() < expected.len() {
            received.extend_from_slice(&rx.recv_bytes(1024).await.unwrap().unwrap());
        }
        assert_eq!(received, expected.as_bytes());
        links.push((rx, tx));
    }
    assert_eq!(relay.registry.len(), 2);
}

#[tokio::test]
async fn test_backend_death_closes_client_and_token() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    let agent = relay.agent(ExecReqInfo::new(ExecReqType::Logs)).await.unwrap();
    spawn_tagging_agent(agent.clone(), "logs");

    let shell = connect_shell(&agent.shell_url(), &relay.client_tls())
        .await
        .unwrap();
    let mut socket = shell.into_inner();
    socket.send(Message::Binary(b"tail".to_vec())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply.into_data(), b"logs:tail".to_vec());

    // Agent process dies
    agent.close("agent crashed");

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client still connected after backend died");
    relay.wait_unregistered(agent.token()).await;
}

#[tokio::test]
async fn test_console_client_death_keeps_session() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;

    let agent = relay
        .agent(ExecReqInfo::console(
            "http://127.0.0.1:6080/vnc.html".parse().unwrap(),
        ))
        .await
        .unwrap();

    // Console websocket endpoint tagging every frame
    {
        let agent = agent.clone();
        tokio::spawn(async move {
            while let Ok(stream) = agent.accept_stream().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Binary(data) = msg {
                            let mut reply = b"vnc:".to_vec();
                            reply.extend_from_slice(&data);
                            if ws.send(Message::Binary(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
    }

    let connector = tokio_tungstenite::Connector::Rustls(Arc::new(
        relay.client_tls().client_config().unwrap(),
    ));
    let url = format!(
        "wss://localhost:{}/websockify?edgetoken={}",
        relay.proxy_port,
        agent.token()
    );

    let (mut first, _) =
        tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector.clone()))
            .await
            .unwrap();
    let (mut second, _) =
        tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector))
            .await
            .unwrap();

    first.send(Message::Binary(vec![1])).await.unwrap();
    assert_eq!(first.next().await.unwrap().unwrap().into_data(), b"vnc:\x01".to_vec());

    // One browser tab goes away without a goodbye
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    second.send(Message::Binary(vec![2])).await.unwrap();
    assert_eq!(second.next().await.unwrap().unwrap().into_data(), b"vnc:\x02".to_vec());
    assert!(relay.registry.contains(agent.token()));
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn test_session_capacity() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default().with_max_sessions(1)).await;

    let first = relay.agent(ExecReqInfo::shell()).await.unwrap();
    let refused = relay.agent(ExecReqInfo::shell()).await;
    assert!(matches!(refused, Err(AgentError::Handshake(_))));
    assert_eq!(relay.registry.len(), 1);

    // The slot frees up once the first agent leaves
    first.close("done");
    relay.wait_unregistered(first.token()).await;
    relay.agent(ExecReqInfo::shell()).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    init_tracing();
    let relay = TestRelay::start(RelayConfig::default()).await;
    let agent = relay.agent(ExecReqInfo::shell()).await.unwrap();

    relay.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), agent.closed())
        .await
        .unwrap();

    let refused = connect_shell(&agent.shell_url(), &relay.client_tls()).await;
    assert!(matches!(refused, Err(ClientError::WebSocket(_)) | Err(ClientError::Refused(_))));
}
