//! Typed error kinds for everything the core can reject (§7).
//!
//! [`ProtocolError`] covers the non-fatal kinds: every one of them surfaces
//! to the client as a `{k:"E"}` message followed by connection close. The one
//! fatal kind — an internal invariant violated during an advance — is
//! deliberately not a variant here; it is handled at the call site by
//! logging and tearing the instance down (§4.G step 5, §7).

use thiserror::Error;

/// Everything the inbound validator (§4.E) or peripheral API (§4.J) can
/// reject. Each variant names which of §7's error classes it belongs to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message could not be parsed: {0}")]
    Malformed(String),

    #[error("frame {frame} is below controller minimum {min}")]
    OutOfOrder { frame: i64, min: u32 },

    #[error("serial {serial} does not exceed last admitted serial {last}")]
    SerialNotIncreasing { serial: i64, last: i64 },

    #[error("frame {frame} exceeds future horizon {limit}")]
    TooFast { frame: i64, limit: u32 },

    #[error("invalid username or password")]
    BadCredentials,

    #[error("instance \"{0}\" does not exist")]
    NoSuchInstance(String),

    #[error("username \"{0}\" is already logged in")]
    AlreadyLoggedIn(String),

    #[error("username \"{0}\" is already registered")]
    UsernameTaken(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("verb \"{0}\" is not accepted by this playset")]
    UnknownVerb(String),

    #[error("command rate cap exceeded for verb \"{0}\"")]
    RateExceeded(String),

    #[error("argument exceeds maximum length")]
    ArgTooLong,

    #[error("input string exceeds maximum length")]
    InputTooLong,

    #[error("chat message exceeds maximum length")]
    ChatTooLong,

    #[error("chat rate exceeded")]
    ChatTooFast,

    #[error("config exceeds maximum size")]
    ConfigTooLarge,

    #[error("admin privilege required")]
    NotAuthorized,

    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Errors from loading or reloading server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors from saving or loading a whole-server snapshot (§4.I, §6.6).
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse snapshot file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("instance \"{0}\" references unknown playset \"{1}\"")]
    UnknownPlayset(String, String),
}
