//! Local TCP port bridged to a shell session

use edgeturn_cert::ClientTlsSettings;
use edgeturn_transport::{bridge, IoStream, PumpConfig};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::shell::connect_shell;
use crate::ClientError;

/// Listens locally and bridges each accepted connection to a fresh shell
/// WebSocket on the relay
pub struct LocalForwarder {
    listener: TcpListener,
    url: String,
    tls: ClientTlsSettings,
    pump: PumpConfig,
}

impl LocalForwarder {
    pub async fn bind(
        listen_addr: SocketAddr,
        url: impl Into<String>,
        tls: ClientTlsSettings,
    ) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self {
            listener,
            url: url.into(),
            tls,
            pump: PumpConfig::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept local connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClientError> {
        info!("Forwarding {} to the relay shell", self.listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let url = self.url.clone();
                    let tls = self.tls.clone();
                    let pump = self.pump.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward(socket, &url, &tls, &pump).await {
                            warn!("Local connection from {} not forwarded: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept local connection: {}", e),
            }
        }

        Ok(())
    }
}

async fn forward(
    socket: TcpStream,
    url: &str,
    tls: &ClientTlsSettings,
    pump: &PumpConfig,
) -> Result<(), ClientError> {
    let shell = connect_shell(url, tls).await?;
    let stats = bridge(IoStream::new(socket), shell, pump).await;
    info!(
        "Local connection closed: {} bytes sent, {} bytes received",
        stats.a_to_b, stats.b_to_a
    );
    Ok(())
}
