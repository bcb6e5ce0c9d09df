//! Client links: one client connection paired with one mux stream

use edgeturn_control::LinkGuard;
use edgeturn_proto::StreamId;
use edgeturn_transport::{bridge, BridgeStats, DuplexStream, PumpConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::info;

/// Admission held for as long as a client link exists
#[derive(Debug)]
pub struct LinkLease {
    guard: LinkGuard,
    _permit: OwnedSemaphorePermit,
}

impl LinkLease {
    pub fn new(guard: LinkGuard, permit: OwnedSemaphorePermit) -> Self {
        Self {
            guard,
            _permit: permit,
        }
    }

    pub fn guard(&self) -> &LinkGuard {
        &self.guard
    }
}

/// A client attached to a session through one multiplexed stream.
///
/// A link is connecting until [`ProxyLink::bridge`] consumes it; once that
/// returns the link is closed and cannot be reused.
///
/// Dropping the link releases its lease; for single-client sessions that
/// closes the backend connection.
#[derive(Debug)]
pub struct ProxyLink {
    peer_addr: SocketAddr,
    token: String,
    stream_id: StreamId,
    lease: Arc<LinkLease>,
}

impl ProxyLink {
    pub fn new(peer_addr: SocketAddr, lease: Arc<LinkLease>, stream_id: StreamId) -> Self {
        Self {
            peer_addr,
            token: lease.guard().session().token().redacted(),
            stream_id,
            lease,
        }
    }

    /// Pump bytes between the client and the backend side until either ends
    pub async fn bridge<C, B>(self, client: C, backend: B, config: &PumpConfig) -> BridgeStats
    where
        C: DuplexStream,
        B: DuplexStream,
    {
        info!(
            "[{}] Client {} attached on stream {} ({} links)",
            self.token,
            self.peer_addr,
            self.stream_id,
            self.lease.guard().session().active_links()
        );

        let stats = bridge(client, backend, config).await;

        info!(
            "[{}] Client {} detached from stream {}: {} bytes up, {} bytes down",
            self.token, self.peer_addr, self.stream_id, stats.a_to_b, stats.b_to_a
        );
        stats
    }
}
