//! Shell attachment and the admission path shared by every client link

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use edgeturn_control::token::redact;
use edgeturn_mux::{MuxError, MuxStream};
use edgeturn_proto::ExecReqType;
use edgeturn_transport::IoStream;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::link::{LinkLease, ProxyLink};
use crate::server::ProxyState;
use crate::websocket::WsDuplex;

/// Query string carrying the session token
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(rename = "edgetoken")]
    pub token: Option<String>,
}

/// Why a client request was refused
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing, unknown, expired, claimed or wrong-kind token.
    /// Deliberately a single variant so the cases cannot be told apart.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Client link limit reached")]
    LinkLimit,

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] MuxError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            ProxyError::LinkLimit => {
                (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response()
            }
            ProxyError::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend unavailable").into_response()
            }
            ProxyError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY.into_response(),
        }
    }
}

/// Admit a client to the session behind `token` and open its stream.
///
/// `accepts` filters the session kinds this entry point serves; a session of
/// any other kind is refused like an unknown token.
pub(crate) async fn open_link(
    state: &ProxyState,
    token: Option<&str>,
    peer_addr: SocketAddr,
    accepts: impl Fn(ExecReqType) -> bool,
) -> Result<(LinkLease, MuxStream), ProxyError> {
    let token = match token {
        Some(token) if !token.is_empty() => token,
        _ => {
            debug!("Client {} presented no token", peer_addr);
            return Err(ProxyError::Unauthorized);
        }
    };

    let session = state.registry.get(token).ok_or_else(|| {
        debug!("Client {} presented unknown token {}", peer_addr, redact(token));
        ProxyError::Unauthorized
    })?;

    if !accepts(session.kind()) {
        debug!(
            "[{}] Client {} used a {} token on the wrong entry point",
            redact(token),
            peer_addr,
            session.kind()
        );
        return Err(ProxyError::Unauthorized);
    }

    let permit = state.links.clone().try_acquire_owned().map_err(|_| {
        warn!("Client link limit reached, refusing {}", peer_addr);
        ProxyError::LinkLimit
    })?;

    let guard = session.admit().map_err(|e| {
        debug!("[{}] Refused client {}: {}", redact(token), peer_addr, e);
        ProxyError::Unauthorized
    })?;

    let stream = session.open_stream().await.map_err(|e| {
        warn!("[{}] Cannot open stream to agent: {}", redact(token), e);
        e
    })?;

    Ok((LinkLease::new(guard, permit), stream))
}

/// `GET /edgeshell?edgetoken=<token>`: attach a WebSocket client to a
/// shell-like session
pub async fn shell(
    State(state): State<ProxyState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ProxyError> {
    let (lease, stream) = open_link(&state, query.token.as_deref(), peer_addr, |kind| {
        kind != ExecReqType::Console
    })
    .await?;

    let link = ProxyLink::new(peer_addr, Arc::new(lease), stream.id());
    let pump = state.pump.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        link.bridge(WsDuplex::new(socket), IoStream::new(stream), &pump)
            .await;
    }))
}
