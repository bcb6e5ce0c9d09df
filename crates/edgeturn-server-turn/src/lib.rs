//! Backend ("turn") listener for EdgeTurn
//!
//! Edge agents dial this listener, ask for a session with a one-line JSON
//! request, and get back the token clients will use to reach them. The
//! connection then carries multiplexed streams until either side ends it.

pub mod server;

pub use server::{TurnServer, TurnServerConfig, TurnServerError};
