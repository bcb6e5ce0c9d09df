//! Backend handshake message types

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Kind of interactive access an agent is offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecReqType {
    /// Interactive shell, one client at a time
    Shell,
    /// Web console reached through the HTTP reverse proxy, many clients
    Console,
    /// Log stream, one client at a time
    Logs,
    /// Access to the cloudlet host shell, one client at a time
    AccessCloudlet,
}

impl ExecReqType {
    /// Whether a session of this kind admits a single client link only.
    ///
    /// The first admitted client claims the session and the backend is
    /// closed when that link ends.
    pub fn is_single_client(&self) -> bool {
        !matches!(self, ExecReqType::Console)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecReqType::Shell => "shell",
            ExecReqType::Console => "console",
            ExecReqType::Logs => "logs",
            ExecReqType::AccessCloudlet => "access-cloudlet",
        }
    }
}

impl fmt::Display for ExecReqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecReqType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ExecReqType::Shell),
            "console" => Ok(ExecReqType::Console),
            "logs" => Ok(ExecReqType::Logs),
            "access-cloudlet" => Ok(ExecReqType::AccessCloudlet),
            other => Err(format!("unknown session type: {}", other)),
        }
    }
}

/// Request sent by an edge agent right after the TLS handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecReqInfo {
    #[serde(rename = "Type")]
    pub kind: ExecReqType,

    /// Landing URL of the console served behind the agent (console sessions)
    #[serde(rename = "InitURL", default, skip_serializing_if = "Option::is_none")]
    pub init_url: Option<Url>,
}

impl ExecReqInfo {
    pub fn new(kind: ExecReqType) -> Self {
        Self {
            kind,
            init_url: None,
        }
    }

    pub fn shell() -> Self {
        Self::new(ExecReqType::Shell)
    }

    pub fn console(init_url: Url) -> Self {
        Self {
            kind: ExecReqType::Console,
            init_url: Some(init_url),
        }
    }
}

/// Reply sent by the relay once the session is registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "Token")]
    pub token: String,

    /// Public port clients use to reach the session
    #[serde(rename = "AccessPort")]
    pub access_port: String,
}
