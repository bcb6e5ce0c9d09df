//! Relay-side session state and client admission

use chrono::{DateTime, Utc};
use edgeturn_mux::{MuxError, MuxSession, MuxStream};
use edgeturn_proto::ExecReqType;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::token::SessionToken;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// Handshake done, not yet registered
    Pending = 0,
    /// Registered; clients may attach
    Active = 1,
    /// Close requested; backend connection being torn down
    Draining = 2,
    /// Removed from the registry
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Pending,
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// Why a client link was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Session is not accepting clients")]
    NotActive,

    #[error("Session already has a client")]
    AlreadyClaimed,
}

/// One backend connection from an edge agent
pub struct Session {
    token: SessionToken,
    kind: ExecReqType,
    init_url: Option<Url>,
    mux: MuxSession,
    access_port: String,
    peer_addr: SocketAddr,
    created_at: Instant,
    started_at: DateTime<Utc>,
    state: AtomicU8,
    claimed: AtomicBool,
    active_links: AtomicUsize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        token: SessionToken,
        kind: ExecReqType,
        init_url: Option<Url>,
        mux: MuxSession,
        access_port: impl Into<String>,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            token,
            kind,
            init_url,
            mux,
            access_port: access_port.into(),
            peer_addr,
            created_at: Instant::now(),
            started_at: Utc::now(),
            state: AtomicU8::new(SessionState::Pending as u8),
            claimed: AtomicBool::new(false),
            active_links: AtomicUsize::new(0),
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn kind(&self) -> ExecReqType {
        self.kind
    }

    pub fn init_url(&self) -> Option<&Url> {
        self.init_url.as_ref()
    }

    pub fn mux(&self) -> &MuxSession {
        &self.mux
    }

    pub fn access_port(&self) -> &str {
        &self.access_port
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn active_links(&self) -> usize {
        self.active_links.load(Ordering::SeqCst)
    }

    /// Pending -> Active
    pub fn activate(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Pending as u8,
            SessionState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Admit one client link.
    ///
    /// Single-client kinds admit exactly one link over their lifetime; the
    /// session is closed when that link is released.
    pub fn admit(self: &Arc<Self>) -> Result<LinkGuard, AdmissionError> {
        if self.state() != SessionState::Active || self.mux.is_closed() {
            return Err(AdmissionError::NotActive);
        }

        if self.kind.is_single_client()
            && self
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(AdmissionError::AlreadyClaimed);
        }

        self.active_links.fetch_add(1, Ordering::SeqCst);
        Ok(LinkGuard {
            session: self.clone(),
        })
    }

    /// Open a stream to the agent for an admitted link
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        self.mux.open_stream().await
    }

    /// Request the session to end: closes the multiplexer and with it the
    /// backend connection and every stream. Idempotent.
    pub fn close(&self, reason: &str) {
        let _ = self.state.compare_exchange(
            SessionState::Active as u8,
            SessionState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            SessionState::Pending as u8,
            SessionState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.mux.close(reason);
    }

    /// Final state once the session has left the registry
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        self.mux.close("session closed");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            token: self.token.redacted(),
            kind: self.kind,
            state: self.state(),
            peer_addr: self.peer_addr,
            started_at: self.started_at,
            age_secs: self.age().as_secs(),
            active_links: self.active_links(),
            active_streams: self.mux.active_streams(),
        }
    }
}

/// Admission of one client link.
///
/// Dropping the guard releases the link; for single-client sessions that
/// ends the session.
#[derive(Debug)]
pub struct LinkGuard {
    session: Arc<Session>,
}

impl LinkGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.session.active_links.fetch_sub(1, Ordering::SeqCst);
        if self.session.kind.is_single_client() {
            debug!(
                "Client left single-client session {:?}, closing backend",
                self.session.token
            );
            self.session.close("client disconnected");
        }
    }
}

/// Point-in-time view of a session, safe to log or expose
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Redacted token
    pub token: String,
    pub kind: ExecReqType,
    pub state: SessionState,
    pub peer_addr: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
    pub active_links: usize,
    pub active_streams: usize,
}
