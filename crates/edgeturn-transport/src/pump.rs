//! Bidirectional byte-pump
//!
//! [`bridge`] copies bytes between two duplex streams until either side is
//! gone. Both copy tasks share a cancellation token: whichever direction ends
//! first finishes its sink and cancels the other, so neither task can outlive
//! the pairing even if it is parked in a read or write.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{DuplexStream, StreamRecv, StreamSend};

/// Byte-pump configuration
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Maximum chunk read from a source at once
    pub buffer_size: usize,
    /// Upper bound for finishing (half-closing) a sink after its source ended
    pub finish_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            finish_timeout: Duration::from_secs(5),
        }
    }
}

/// Byte counts of a completed bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until one side ends or fails.
///
/// Both copy tasks have exited when this returns. Errors are not reported;
/// the caller only learns how many bytes went each way.
pub async fn bridge<A, B>(a: A, b: B, config: &PumpConfig) -> BridgeStats
where
    A: DuplexStream,
    B: DuplexStream,
{
    let (a_rx, a_tx) = a.split();
    let (b_rx, b_tx) = b.split();
    let stop = CancellationToken::new();

    let forward = tokio::spawn(pump(a_rx, b_tx, stop.clone(), config.clone(), "a->b"));
    let backward = tokio::spawn(pump(b_rx, a_tx, stop.clone(), config.clone(), "b->a"));

    let (forward, backward) = tokio::join!(forward, backward);

    BridgeStats {
        a_to_b: forward.unwrap_or_default(),
        b_to_a: backward.unwrap_or_default(),
    }
}

async fn pump<R, W>(
    mut source: R,
    mut sink: W,
    stop: CancellationToken,
    config: PumpConfig,
    direction: &'static str,
) -> u64
where
    R: StreamRecv,
    W: StreamSend,
{
    let mut total = 0u64;

    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => {
                trace!("Pump {} stopped by sibling", direction);
                break;
            }
            res = source.recv_bytes(config.buffer_size) => res,
        };

        let data = match received {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("Pump {} reached end of stream", direction);
                break;
            }
            Err(e) => {
                debug!("Pump {} read error: {}", direction, e);
                break;
            }
        };

        if data.is_empty() {
            continue;
        }

        let len = data.len() as u64;
        let sent = tokio::select! {
            _ = stop.cancelled() => {
                trace!("Pump {} stopped by sibling", direction);
                break;
            }
            res = sink.send_bytes(data) => res,
        };

        if let Err(e) = sent {
            debug!("Pump {} write error: {}", direction, e);
            break;
        }
        total += len;
    }

    if tokio::time::timeout(config.finish_timeout, sink.finish())
        .await
        .is_err()
    {
        debug!("Pump {} timed out finishing sink", direction);
    }
    stop.cancel();

    total
}
