//! Stream multiplexing over a single backend connection
//!
//! A [`MuxSession`] turns one reliable ordered byte stream (the TLS
//! connection from an edge agent) into many independent [`MuxStream`]s.
//! The physical connection is owned by a [`MuxDriver`] task; once it fails
//! or the session is closed, every stream fails with an error and no new
//! stream can be opened or accepted.

pub mod config;
pub mod session;
pub mod stream;

pub use config::{MuxConfig, MuxRole};
pub use session::{MuxDriver, MuxError, MuxSession};
pub use stream::MuxStream;
