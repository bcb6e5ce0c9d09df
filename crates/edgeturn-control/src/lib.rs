//! Session control plane for the EdgeTurn relay
//!
//! Holds the sessions created by edge agents, keyed by an unguessable token,
//! and decides which client links may attach to them.

pub mod registry;
pub mod session;
pub mod token;

pub use registry::{RegistryError, SessionRegistry};
pub use session::{AdmissionError, LinkGuard, Session, SessionSnapshot, SessionState};
pub use token::SessionToken;
