//! Core abstraction for the pluggable, deterministic game-logic module the
//! relay server calls a *playset* (§4.H, §6.4).
//!
//! A playset is the only part of the system that is allowed to know what the
//! game actually is. The core invokes [`Playset::advance`] once per frame and
//! otherwise treats the world state as opaque bytes it round-trips through
//! [`Playset::serialize`]/[`Playset::deserialize`]. Any non-determinism inside
//! a playset is a playset defect, not a core one.
//!
//! # Implementing a playset
//!
//! ```ignore
//! impl Playset for DotSet {
//!     fn advance(&self, state: &mut Value, connects: &[ConnectEvent], commands: &[CommandEvent],
//!                inputs: &[ControllerInput], disconnects: &[DisconnectEvent]) { /* ... */ }
//!     fn command_limits(&self) -> &CommandLimits { &self.limits }
//! }
//! ```

pub mod hash;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A connect event as delivered to [`Playset::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub controller: u32,
}

/// A command event as delivered to [`Playset::advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub controller: u32,
    pub serial: u32,
    pub verb: String,
    pub arg: Option<String>,
}

/// A disconnect event as delivered to [`Playset::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectEvent {
    pub controller: u32,
}

/// One controller's latest input string, as assembled from `controller_status`
/// in ascending controller-id order before every `advance` call (§4.G step 7).
/// This ordering is mandatory for determinism — never iterate a hash map here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInput {
    pub controller: u32,
    pub last_input_string: String,
}

/// Per-verb command rate caps and argument-length cap a playset declares.
///
/// Default (no verbs registered) accepts no commands at all, matching §4.H's
/// "default: no commands accepted".
#[derive(Debug, Clone, Default)]
pub struct CommandLimits {
    /// verb -> max admissions per frame-grouping window.
    pub rate_caps: HashMap<String, u32>,
    pub max_arg_len: usize,
}

impl CommandLimits {
    pub fn new(max_arg_len: usize) -> Self {
        Self { rate_caps: HashMap::new(), max_arg_len }
    }

    pub fn with_verb(mut self, verb: impl Into<String>, rate_cap: u32) -> Self {
        self.rate_caps.insert(verb.into(), rate_cap);
        self
    }

    pub fn allows(&self, verb: &str) -> bool {
        self.rate_caps.contains_key(verb)
    }

    pub fn rate_cap(&self, verb: &str) -> Option<u32> {
        self.rate_caps.get(verb).copied()
    }
}

/// The contract a deterministic game-logic module must satisfy (§4.H).
///
/// Required: [`Playset::advance`]. Everything else has a spec-mandated
/// default so a minimal playset can implement just the state transition.
pub trait Playset: Send + Sync {
    /// The globally unique name this playset is registered under.
    fn name(&self) -> &str;

    /// Applies one frame's worth of canonically-ordered events to `state`.
    /// The playset may only mutate `state`; it must not read or write any
    /// other process-global state (§4.H — determinism is a playset defect
    /// otherwise).
    fn advance(
        &self,
        state: &mut Value,
        connects: &[ConnectEvent],
        commands: &[CommandEvent],
        inputs: &[ControllerInput],
        disconnects: &[DisconnectEvent],
    );

    /// The state a brand-new instance of this playset starts with.
    fn initial_state(&self) -> Value;

    /// Declared command verbs and their per-frame rate caps. Default: empty,
    /// i.e. no commands accepted.
    fn command_limits(&self) -> CommandLimits {
        CommandLimits::default()
    }

    /// Maximum accepted length, in bytes, of a Frame event's `input` string.
    /// Default chosen generously; playsets with tighter state should override.
    fn max_input_len(&self) -> usize {
        256
    }

    /// Serializes `state` to its wire/storage form. Default: structural JSON,
    /// i.e. the value as-is (serde_json::Value already *is* the structural form).
    fn serialize(&self, state: &Value) -> Value {
        state.clone()
    }

    /// Inverse of [`Playset::serialize`]. Default: identity.
    fn deserialize(&self, wire: &Value) -> Value {
        wire.clone()
    }

    /// A structural copy of `state`, used when a snapshot needs a point-in-time
    /// clone without aliasing. Default: round-trip through serialize/deserialize.
    fn copy(&self, state: &Value) -> Value {
        self.deserialize(&self.serialize(state))
    }

    /// The structural hash used for hash-sync (§6.5). Default: [`hash::structural_hash`]
    /// over the serialized form. Returning `None` disables hash-sync for this
    /// playset (the advancer then falls back to plain frame-broadcast notices).
    fn hash(&self, state: &Value) -> Option<i64> {
        Some(hash::structural_hash(&self.serialize(state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Playset for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn advance(
            &self,
            _state: &mut Value,
            _connects: &[ConnectEvent],
            _commands: &[CommandEvent],
            _inputs: &[ControllerInput],
            _disconnects: &[DisconnectEvent],
        ) {
        }
        fn initial_state(&self) -> Value {
            serde_json::json!({})
        }
    }

    #[test]
    fn defaults_are_structural_round_trip() {
        let p = Noop;
        let state = serde_json::json!({"a": 1, "b": [1, 2, 3]});
        assert_eq!(p.copy(&state), state);
        assert!(p.hash(&state).is_some());
    }

    #[test]
    fn default_command_limits_accept_nothing() {
        let p = Noop;
        assert!(!p.command_limits().allows("anything"));
    }
}
