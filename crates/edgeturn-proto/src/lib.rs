//! EdgeTurn protocol definitions
//!
//! This crate defines the backend handshake messages, their line-delimited
//! JSON encoding, and the frame format used by the stream multiplexer that
//! runs over every backend connection once the handshake completes.

pub mod handshake;
pub mod messages;
pub mod mux;

pub use handshake::{encode_line, read_line, write_line, HandshakeError};
pub use messages::{ExecReqInfo, ExecReqType, SessionInfo};
pub use mux::{Frame, FrameCodec, FrameError, FrameFlags, FrameType, StreamId};

/// Maximum size of a single handshake line (request or reply), newline included
pub const MAX_HANDSHAKE_LINE: usize = 4 * 1024;

/// Maximum mux frame payload (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Path clients use to attach to a shell-like session
pub const SHELL_PATH: &str = "/edgeshell";

/// Path browsers use to start a console session
pub const CONSOLE_PATH: &str = "/edgeconsole";

/// Query parameter and cookie name carrying the session token
pub const TOKEN_PARAM: &str = "edgetoken";
