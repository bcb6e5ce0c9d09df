//! EdgeTurn library - public API of the reverse-tunnel relay
//!
//! Edge agents behind NAT dial out to the relay's backend listener and get a
//! session token; end users present that token to the client listener and
//! are bridged to the agent over the agent's own connection.
//!
//! # Running a relay
//!
//! ```ignore
//! use edgeturn_lib::{Relay, RelayConfig, TlsSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tls = TlsSettings::new("cert.pem", "key.pem");
//!     let config = RelayConfig::default()
//!         .with_backend_tls(tls.clone())
//!         .with_proxy_tls(tls)
//!         .with_access_port("443");
//!
//!     let relay = Relay::bind(config).await?;
//!     println!("agents dial {}", relay.turn_addr());
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod relay;

pub use relay::{Relay, RelayConfig, RelayError};

pub use edgeturn_cert::{generate_self_signed_cert, CertError, ClientTlsSettings, TlsSettings};
pub use edgeturn_control::{Session, SessionRegistry, SessionSnapshot, SessionState, SessionToken};
pub use edgeturn_mux::{MuxConfig, MuxError, MuxSession, MuxStream};
pub use edgeturn_proto::{ExecReqInfo, ExecReqType, SessionInfo};
pub use edgeturn_server_proxy::{ProxyServer, ProxyServerConfig, ProxyServerError};
pub use edgeturn_server_turn::{TurnServer, TurnServerConfig, TurnServerError};
pub use edgeturn_transport::{bridge, BridgeStats, PumpConfig, StreamAcceptor};
