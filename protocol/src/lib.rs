//! The wire message kinds and global constants shared across the relay
//! server and its clients. These stay consistent between both sides of the
//! socket (§6.1-§6.3).
//!
//! Messages are tagged JSON objects (`{"k": "...", ...}`), carried as
//! WebSocket text frames — the deterministic lockstep protocol this crate
//! describes is explicitly text/JSON (§6.1), not a binary framing.

use serde::{Deserialize, Serialize};

/// Frames per second the whole system ticks at.
pub const FRAME_RATE: u32 = 30;
/// How many frames behind "now" the authoritative past-horizon state sits.
pub const PAST_HORIZON_FRAMES: u32 = FRAME_RATE / 2;
/// The strictest future frame a client may stamp an event at.
pub const FUTURE_HORIZON_FRAMES: u32 = FRAME_RATE * 3 / 2;
/// Inactivity timeout for a LIVE controller, in seconds.
pub const CONTROLLER_TIMEOUT_SECS: u64 = 5;
/// Default number of frames between hash-sync broadcasts.
pub const DEFAULT_HASH_SYNC_INTERVAL: u32 = FRAME_RATE * 5;
/// Default number of frames between plain frame-advance broadcasts.
pub const DEFAULT_FRAME_BROADCAST_INTERVAL: u32 = FRAME_RATE / 4;
/// Maximum size, in bytes, of a single inbound message (§6.1).
pub const MAX_INBOUND_MESSAGE_BYTES: usize = 20_000;
/// Maximum size, in bytes, of a user's opaque config string (§3).
pub const MAX_USER_CONFIG_BYTES: usize = 10_000;
/// Maximum length, in bytes, of a single global chat message.
pub const MAX_CHAT_MESSAGE_BYTES: usize = 280;

/// One controller's standing as of `past_horizon_frame` (§3 `controller_status`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerStatus {
    pub username: String,
    #[serde(rename = "lastInput", default)]
    pub last_input_string: String,
}

/// Client -> server messages (§6.2). Internally tagged on `k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum ClientMessage {
    #[serde(rename = "prelogin")]
    Prelogin,
    #[serde(rename = "l")]
    Login { u: String, p: String, n: String },
    #[serde(rename = "f")]
    Frame { f: i64, i: String },
    #[serde(rename = "o")]
    Command {
        f: i64,
        s: i64,
        o: String,
        #[serde(default)]
        a: Option<String>,
    },
    #[serde(rename = "g")]
    Chat { m: String },
    #[serde(rename = "selfServeCreateUser")]
    SelfServeCreateUser { u: String, p: String, d: String },
    #[serde(rename = "changeMyPassword")]
    ChangeMyPassword { u: String, p: String, n: String },
    #[serde(rename = "getMyConfig")]
    GetMyConfig { u: String, p: String },
    #[serde(rename = "setMyConfig")]
    SetMyConfig { u: String, p: String, d: String },
    #[serde(rename = "cleanShutdown")]
    CleanShutdown { u: String, p: String, r: String },
    #[serde(rename = "dirtyShutdown")]
    DirtyShutdown { u: String, p: String, r: String },
}

/// Server -> client messages (§6.3). Internally tagged on `k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "k")]
pub enum ServerMessage {
    /// Prelogin instance list.
    #[serde(rename = "U")]
    InstanceList { n: String, l: Vec<String> },
    /// Login accepted; initial timing pong. A snapshot (`S`) follows.
    #[serde(rename = "W")]
    Welcome { t: i64 },
    /// The initial full-state snapshot handed to a freshly-LIVE controller.
    #[serde(rename = "S")]
    Snapshot {
        /// Playset name.
        p: String,
        /// This controller's own id.
        c: u32,
        /// Controller status roster as of past horizon.
        x: std::collections::BTreeMap<u32, ControllerStatus>,
        /// Serialized past-horizon state.
        g: serde_json::Value,
        /// Past-horizon frame number.
        f: u32,
        /// Pending, unsorted events (frame >= past horizon), for the client to replay.
        e: Vec<serde_json::Value>,
        /// Frames per second.
        r: u32,
        /// Maximum chat message length.
        l: usize,
        /// Current chat token balance.
        m: u32,
    },
    /// Past horizon advanced to frame `f`, optionally with a structural hash.
    #[serde(rename = "F")]
    FrameAdvance {
        f: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        h: Option<i64>,
    },
    /// A relayed Connect event.
    #[serde(rename = "c")]
    ConnectRelay { f: u32, c: u32, u: String },
    /// A relayed Command event.
    #[serde(rename = "o")]
    CommandRelay {
        f: u32,
        c: u32,
        s: u32,
        o: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        a: Option<String>,
    },
    /// A relayed Frame event. Carries a timing pong `t` only in the copy sent
    /// back to the event's own sender (§4.F).
    #[serde(rename = "f")]
    FrameRelay {
        f: u32,
        c: u32,
        i: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        t: Option<i64>,
    },
    /// A relayed Disconnect event.
    #[serde(rename = "d")]
    DisconnectRelay { f: u32, c: u32 },
    /// Relayed global chat.
    #[serde(rename = "g")]
    ChatRelay { c: u32, u: String, m: String },
    /// +1 chat token.
    #[serde(rename = "G")]
    ChatTokenGrant,
    /// Error; server closes the connection after sending this.
    #[serde(rename = "E")]
    Error { e: String },
    /// Success response for a one-shot API call; server closes after sending.
    #[serde(rename = "D")]
    Done { d: String },
}
