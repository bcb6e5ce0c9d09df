//! Console sessions: cookie-setting entry point and HTTP reverse proxy

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgeturn_control::token::redact;
use edgeturn_proto::{ExecReqType, TOKEN_PARAM};
use edgeturn_transport::IoStream;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::handlers::{open_link, ProxyError, TokenQuery};
use crate::link::ProxyLink;
use crate::server::ProxyState;

/// Query parameter of a console init URL that smuggles a cookie for the
/// console application
const SESSION_COOKIE_PARAM: &str = "sessioncookie";

/// `GET /edgeconsole?edgetoken=<token>`: remember the token in a cookie and
/// redirect the browser to the console landing page on this listener
pub async fn console_start(
    State(state): State<ProxyState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or(ProxyError::Unauthorized)?;

    let session = state
        .registry
        .get(&token)
        .filter(|s| s.kind() == ExecReqType::Console)
        .ok_or_else(|| {
            debug!("Console start from {} with unknown token {}", peer_addr, redact(&token));
            ProxyError::Unauthorized
        })?;
    let init_url = session.init_url().ok_or(ProxyError::Unauthorized)?;

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ProxyError::BadRequest("missing Host header".to_string()))?;

    let redirect = console_redirect(init_url, host, &token, state.cookie_max_age.as_secs())?;

    info!(
        "[{}] Console client {} redirected to {}",
        redact(&token),
        peer_addr,
        init_url.path()
    );
    Ok((StatusCode::PERMANENT_REDIRECT, redirect).into_response())
}

/// Location and cookies for the console redirect
fn console_redirect(
    init_url: &Url,
    host: &str,
    token: &str,
    cookie_max_age: u64,
) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    append_header(
        &mut headers,
        header::SET_COOKIE,
        format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly",
            TOKEN_PARAM, token, cookie_max_age
        ),
    )?;

    let mut query = Vec::new();
    for pair in init_url.query().unwrap_or_default().split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((SESSION_COOKIE_PARAM, encoded)) => {
                match decode_session_cookie(encoded) {
                    Some(cookie) => append_header(&mut headers, header::SET_COOKIE, cookie)?,
                    None => debug!("Ignoring malformed {} in console URL", SESSION_COOKIE_PARAM),
                }
            }
            _ => query.push(pair),
        }
    }

    let mut location = format!("https://{}{}", host, init_url.path());
    if !query.is_empty() {
        location.push('?');
        location.push_str(&query.join("&"));
    }
    append_header(&mut headers, header::LOCATION, location)?;

    Ok(headers)
}

/// Turn a base64 `name=value;Path=/p` cookie into a `Set-Cookie` value
fn decode_session_cookie(encoded: &str) -> Option<String> {
    let encoded = url::form_urlencoded::parse(format!("v={}", encoded).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())?;
    let decoded = STANDARD.decode(encoded.as_bytes()).ok()?;
    let cookie = String::from_utf8(decoded).ok()?;

    let mut parts = cookie.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    if name.is_empty() {
        return None;
    }

    let path = parts.find_map(|attr| {
        attr.trim()
            .split_once('=')
            .filter(|(key, _)| key.eq_ignore_ascii_case("Path"))
            .map(|(_, path)| path.to_string())
    });

    Some(match path {
        Some(path) => format!("{}={}; Path={}", name, value, path),
        None => format!("{}={}", name, value),
    })
}

fn append_header(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: String,
) -> Result<(), ProxyError> {
    let value = HeaderValue::from_str(&value)
        .map_err(|_| ProxyError::BadRequest(format!("invalid {} value", name)))?;
    headers.append(name, value);
    Ok(())
}

/// Token from the `edgetoken` query parameter, else from the cookie
fn request_token(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == TOKEN_PARAM)
            .map(|(_, v)| v.into_owned())
    });
    if from_query.is_some() {
        return from_query;
    }

    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|c| c.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_PARAM)
        .map(|(_, value)| value.to_string())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove connection-scoped headers; `Connection`/`Upgrade` survive when
/// the exchange is a protocol upgrade
fn strip_hop_headers(headers: &mut HeaderMap, keep_upgrade: bool) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .filter(|name| !(keep_upgrade && *name == header::UPGRADE))
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    if !keep_upgrade {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
    }
}

/// Fallback route: forward the request to the console behind the token.
///
/// Each request is an HTTP/1.1 exchange on a fresh stream to the agent.
/// A `101 Switching Protocols` answer turns that stream into a raw link
/// between the browser and the console.
pub async fn console_proxy(
    State(state): State<ProxyState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let token = request_token(&req);
    let (lease, stream) = open_link(&state, token.as_deref(), peer_addr, |kind| {
        kind == ExecReqType::Console
    })
    .await?;
    let stream_id = stream.id();
    let lease = Arc::new(lease);

    let upgrading = is_upgrade_request(req.headers());
    let client_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));
    strip_hop_headers(req.headers_mut(), upgrading);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::BadGateway(e.to_string()))?;

    let conn_lease = lease.clone();
    tokio::spawn(async move {
        let _lease = conn_lease;
        if let Err(e) = conn.with_upgrades().await {
            debug!("Console stream {} ended with error: {}", stream_id, e);
        }
    });

    let mut response = sender.send_request(req).await.map_err(|e| {
        debug!("Console request on stream {} failed: {}", stream_id, e);
        ProxyError::BadGateway(e.to_string())
    })?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            return Err(ProxyError::BadGateway(
                "console switched protocols unasked".to_string(),
            ));
        };
        let backend_upgrade = hyper::upgrade::on(&mut response);
        let link = ProxyLink::new(peer_addr, lease, stream_id);
        let pump = state.pump.clone();

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    link.bridge(
                        IoStream::new(TokioIo::new(client)),
                        IoStream::new(TokioIo::new(backend)),
                        &pump,
                    )
                    .await;
                }
                Err(e) => debug!("Console upgrade on stream {} failed: {}", stream_id, e),
            }
        });
    } else {
        strip_hop_headers(response.headers_mut(), false);
    }

    Ok(response.map(Body::new))
}
