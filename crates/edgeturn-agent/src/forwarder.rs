//! Forwarding relay streams to a local TCP service

use edgeturn_mux::MuxStream;
use edgeturn_transport::{bridge, IoStream, PumpConfig};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connector::AgentSession;

/// Bridges every stream of a session to a fresh connection to `target`
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    target: String,
    pump: PumpConfig,
}

impl TcpForwarder {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            pump: PumpConfig::default(),
        }
    }

    pub fn with_pump_config(mut self, pump: PumpConfig) -> Self {
        self.pump = pump;
        self
    }

    /// Serve streams until the session ends
    pub async fn serve(&self, session: &AgentSession) {
        info!("Forwarding client streams to {}", self.target);

        while let Ok(stream) = session.accept_stream().await {
            let forwarder = self.clone();
            tokio::spawn(async move { forwarder.forward(stream).await });
        }

        debug!("Session ended, forwarder for {} stopped", self.target);
    }

    async fn forward(&self, stream: MuxStream) {
        let stream_id = stream.id();
        let target = match TcpStream::connect(&self.target).await {
            Ok(target) => target,
            Err(e) => {
                // Dropping the stream resets it on the relay side
                warn!(
                    "Stream {}: failed to connect to {}: {}",
                    stream_id, self.target, e
                );
                return;
            }
        };
        let _ = target.set_nodelay(true);

        let stats = bridge(IoStream::new(stream), IoStream::new(target), &self.pump).await;
        debug!(
            "Stream {} to {} finished: {} bytes in, {} bytes out",
            stream_id, self.target, stats.a_to_b, stats.b_to_a
        );
    }
}
