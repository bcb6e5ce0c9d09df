//! Multiplexer configuration

use std::time::Duration;

/// Which side of the multiplexed connection this endpoint is.
///
/// The two sides allocate stream IDs from disjoint sets so that both can
/// open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opens odd stream IDs (the relay)
    Client,
    /// Opens even stream IDs (the edge agent)
    Server,
}

impl MuxRole {
    pub(crate) fn first_stream_id(&self) -> u32 {
        match self {
            MuxRole::Client => 1,
            MuxRole::Server => 2,
        }
    }

    /// Whether `id` is one the remote side is allowed to open
    pub(crate) fn is_peer_stream_id(&self, id: u32) -> bool {
        match self {
            MuxRole::Client => id != 0 && id % 2 == 0,
            MuxRole::Server => id % 2 == 1,
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum concurrently open streams
    pub max_streams: usize,
    /// Inbound bytes queued for one stream before it is reset
    pub stream_backlog_limit: usize,
    /// Outbound data frames buffered across all streams
    pub outbound_buffer: usize,
    /// Largest payload written in a single data frame
    pub max_frame_size: usize,
    /// Whether streams opened by the peer are accepted (otherwise reset)
    pub accept_streams: bool,
    /// Peer-opened streams waiting for `accept_stream`
    pub accept_backlog: usize,
    /// Ping interval; `None` disables keepalive
    pub keepalive_interval: Option<Duration>,
    /// Close the session when nothing was received for this long
    pub keepalive_timeout: Duration,
    /// Reset a stream whose reader takes none of its queued data for this long
    pub stream_send_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            stream_backlog_limit: 4 * 1024 * 1024,
            outbound_buffer: 256,
            max_frame_size: 64 * 1024,
            accept_streams: true,
            accept_backlog: 64,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Duration::from_secs(90),
            stream_send_timeout: Duration::from_secs(30),
        }
    }
}

impl MuxConfig {
    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn with_accept_streams(mut self, accept: bool) -> Self {
        self.accept_streams = accept;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_stream_send_timeout(mut self, timeout: Duration) -> Self {
        self.stream_send_timeout = timeout;
        self
    }

    pub fn with_stream_backlog_limit(mut self, bytes: usize) -> Self {
        self.stream_backlog_limit = bytes;
        self
    }
}
