//! Frontend ("proxy") listener for EdgeTurn
//!
//! End-user clients present a session token here. Shell-like sessions are
//! reached through a WebSocket on [`edgeturn_proto::SHELL_PATH`]; console
//! sessions are served as a reverse proxy whose every HTTP request travels
//! over its own multiplexed stream to the agent.

pub mod console;
pub mod handlers;
pub mod link;
pub mod server;
pub mod websocket;

pub use link::ProxyLink;
pub use server::{build_router, ProxyServer, ProxyServerConfig, ProxyServerError, ProxyState};
pub use websocket::WsDuplex;
