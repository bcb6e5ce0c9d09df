//! Session registry: token -> live session

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::session::{Session, SessionSnapshot};
use crate::token::{redact, SessionToken};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Token already in use: {0}")]
    TokenInUse(String),

    #[error("Session limit reached ({0} active sessions)")]
    CapacityExceeded(usize),
}

/// Registry of live sessions.
///
/// A token maps to at most one session and is never overwritten. Entries
/// are inserted by the backend listener after a successful handshake and
/// removed when that backend connection ends.
pub struct SessionRegistry {
    sessions: DashMap<SessionToken, Arc<Session>>,
    /// Inserted sessions plus in-flight reservations
    reserved: AtomicUsize,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions: None,
        }
    }

    /// Refuse new sessions once `max` are registered
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    fn reserve_slot(&self) -> Result<(), RegistryError> {
        match self.max_sessions {
            Some(max) => self
                .reserved
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| RegistryError::CapacityExceeded(max)),
            None => {
                self.reserved.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Insert a session under its token; never replaces an existing entry
    pub fn put(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        self.reserve_slot()?;

        match self.sessions.entry(session.token().clone()) {
            Entry::Occupied(_) => {
                self.release_slot();
                Err(RegistryError::TokenInUse(session.token().redacted()))
            }
            Entry::Vacant(entry) => {
                trace!("Registering session {:?}", session.token());
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, token: &str) -> bool {
        self.sessions.contains_key(token)
    }

    /// Remove a token. Idempotent; returns the session if it was present.
    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(token).map(|(_, session)| session);
        if removed.is_some() {
            self.release_slot();
            debug!("Removed session {}", redact(token));
        }
        removed
    }

    /// Remove `session` only if it is the entry registered under its token
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.token().as_str(), |_, current| {
                Arc::ptr_eq(current, session)
            })
            .is_some();
        if removed {
            self.release_slot();
            debug!("Removed session {:?}", session.token());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Close every registered session (relay shutdown)
    pub fn close_all(&self, reason: &str) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for session in sessions {
            session.close(reason);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeturn_mux::{MuxConfig, MuxRole, MuxSession};
    use edgeturn_proto::ExecReqType;

    fn session_with_token(token: SessionToken) -> Arc<Session> {
        let (a, _b) = tokio::io::duplex(1024);
        let (mux, _driver) = MuxSession::new(a, MuxRole::Client, MuxConfig::default());
        Arc::new(Session::new(
            token,
            ExecReqType::Shell,
            None,
            mux,
            "8443",
            "127.0.0.1:50000".parse().unwrap(),
        ))
    }

    fn new_session() -> Arc<Session> {
        session_with_token(SessionToken::generate())
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        let session = new_session();
        let token = session.token().as_str().to_string();

        registry.put(session.clone()).unwrap();
        assert!(registry.contains(&token));
        assert!(Arc::ptr_eq(&registry.get(&token).unwrap(), &session));

        assert!(registry.remove(&token).is_some());
        assert!(registry.remove(&token).is_none());
        assert!(registry.get(&token).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_token_never_overwrites() {
        let registry = SessionRegistry::new();
        let first = session_with_token(SessionToken::from("same"));
        let second = session_with_token(SessionToken::from("same"));

        registry.put(first.clone()).unwrap();
        assert!(matches!(
            registry.put(second),
            Err(RegistryError::TokenInUse(_))
        ));
        assert!(Arc::ptr_eq(&registry.get("same").unwrap(), &first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_session_checks_identity() {
        let registry = SessionRegistry::new();
        let first = session_with_token(SessionToken::from("tok"));
        let impostor = session_with_token(SessionToken::from("tok"));

        registry.put(first.clone()).unwrap();
        assert!(!registry.remove_session(&impostor));
        assert!(registry.contains("tok"));
        assert!(registry.remove_session(&first));
        assert!(!registry.remove_session(&first));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = SessionRegistry::new().with_max_sessions(2);
        let a = new_session();
        registry.put(a.clone()).unwrap();
        registry.put(new_session()).unwrap();

        assert!(matches!(
            registry.put(new_session()),
            Err(RegistryError::CapacityExceeded(2))
        ));

        // A freed slot can be reused
        registry.remove(a.token().as_str());
        registry.put(new_session()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_put_and_remove() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let session = new_session();
                    registry.put(session.clone()).unwrap();
                    assert!(registry.get(session.token().as_str()).is_some());
                    assert!(registry.remove_session(&session));
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let session = new_session();
        session.activate();
        registry.put(session.clone()).unwrap();

        registry.close_all("relay shutting down");
        assert!(session.mux().is_closed());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
