//! Session tokens

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::borrow::Borrow;
use std::fmt;

/// Random bytes per token (160 bits)
const TOKEN_BYTES: usize = 20;

/// Characters of a token that may appear in logs
const REDACTED_PREFIX: usize = 6;

/// Opaque, unguessable session token.
///
/// `Debug` output is redacted; use [`SessionToken::as_str`] when the full
/// value has to go on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh token from the operating system CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe to log
    pub fn redacted(&self) -> String {
        redact(&self.0)
    }
}

/// Redact an arbitrary token string for logging
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(REDACTED_PREFIX).collect();
    format!("{}…", prefix)
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.redacted())
    }
}

impl Borrow<str> for SessionToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
