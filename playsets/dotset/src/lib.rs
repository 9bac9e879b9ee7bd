//! `dotset` — a minimal deterministic playset used as the core's reference
//! implementation and in its end-to-end tests (spec §8 scenario S1 names its
//! registered name, `testgame1`, and its starting state, `{"dots":[]}`).
//!
//! Players place and clear dots on a shared canvas. There is no win
//! condition; the point of this playset is to exercise every part of the
//! [`Playset`] contract (commands, frame inputs, connect/disconnect cleanup,
//! hashing) with the least game-specific noise possible, the way the
//! reference relay server's tic-tac-toe backend exercises `BackEndArchitecture`.

use playset::{CommandEvent, CommandLimits, ConnectEvent, ControllerInput, DisconnectEvent, Playset};
use serde_json::{Value, json};

/// The registered name this playset is looked up under (§8 S1).
pub const NAME: &str = "testgame1";

/// Per-controller rate cap for each verb, per frame-grouping window.
const PLACE_RATE_CAP: u32 = 8;
const CLEAR_RATE_CAP: u32 = 1;
/// `"x,y"` encoded as decimal integers never needs more than this many bytes.
const MAX_ARG_LEN: usize = 32;

pub struct DotSet {
    limits: CommandLimits,
}

impl Default for DotSet {
    fn default() -> Self {
        let limits = CommandLimits::new(MAX_ARG_LEN)
            .with_verb("place", PLACE_RATE_CAP)
            .with_verb("clear", CLEAR_RATE_CAP);
        Self { limits }
    }
}

impl DotSet {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parses `"x,y"` into integer coordinates. Returns `None` on any malformed
/// argument — the playset silently ignores the command rather than treating
/// a bad argument as a protocol error (that classification belongs to the
/// core's inbound validator, §4.E, which only checks length, not content).
fn parse_xy(arg: &str) -> Option<(i64, i64)> {
    let (x, y) = arg.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

impl Playset for DotSet {
    fn name(&self) -> &str {
        NAME
    }

    fn advance(
        &self,
        state: &mut Value,
        _connects: &[ConnectEvent],
        commands: &[CommandEvent],
        _inputs: &[ControllerInput],
        disconnects: &[DisconnectEvent],
    ) {
        let dots = state
            .as_object_mut()
            .and_then(|obj| obj.get_mut("dots"))
            .and_then(Value::as_array_mut)
            .expect("dotset state always has a \"dots\" array");

        for command in commands {
            match command.verb.as_str() {
                "place" => {
                    let Some(arg) = command.arg.as_deref() else { continue };
                    let Some((x, y)) = parse_xy(arg) else { continue };
                    dots.push(json!({"owner": command.controller, "x": x, "y": y}));
                }
                "clear" => {
                    dots.retain(|dot| dot["owner"] != json!(command.controller));
                }
                _ => {}
            }
        }

        for disconnect in disconnects {
            dots.retain(|dot| dot["owner"] != json!(disconnect.controller));
        }
    }

    fn initial_state(&self) -> Value {
        json!({"dots": []})
    }

    fn command_limits(&self) -> CommandLimits {
        self.limits.clone()
    }

    fn max_input_len(&self) -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(controller: u32, verb: &str, arg: Option<&str>) -> CommandEvent {
        CommandEvent { controller, serial: 1, verb: verb.to_string(), arg: arg.map(str::to_string) }
    }

    #[test]
    fn initial_state_matches_spec_scenario_s1() {
        let dotset = DotSet::new();
        assert_eq!(dotset.initial_state(), json!({"dots": []}));
    }

    #[test]
    fn place_appends_a_dot_owned_by_the_sender() {
        let dotset = DotSet::new();
        let mut state = dotset.initial_state();
        dotset.advance(&mut state, &[], &[command(7, "place", Some("3,4"))], &[], &[]);
        assert_eq!(state, json!({"dots": [{"owner": 7, "x": 3, "y": 4}]}));
    }

    #[test]
    fn malformed_place_argument_is_ignored() {
        let dotset = DotSet::new();
        let mut state = dotset.initial_state();
        dotset.advance(&mut state, &[], &[command(7, "place", Some("not-a-point"))], &[], &[]);
        assert_eq!(state, json!({"dots": []}));
    }

    #[test]
    fn clear_removes_only_the_sending_controllers_dots() {
        let dotset = DotSet::new();
        let mut state = json!({"dots": [{"owner": 1, "x": 0, "y": 0}, {"owner": 2, "x": 1, "y": 1}]});
        dotset.advance(&mut state, &[], &[command(1, "clear", None)], &[], &[]);
        assert_eq!(state, json!({"dots": [{"owner": 2, "x": 1, "y": 1}]}));
    }

    #[test]
    fn disconnect_cleans_up_the_departing_controllers_dots() {
        let dotset = DotSet::new();
        let mut state = json!({"dots": [{"owner": 1, "x": 0, "y": 0}, {"owner": 2, "x": 1, "y": 1}]});
        dotset.advance(&mut state, &[], &[], &[], &[DisconnectEvent { controller: 1 }]);
        assert_eq!(state, json!({"dots": [{"owner": 2, "x": 1, "y": 1}]}));
    }

    #[test]
    fn hash_is_deterministic_across_equal_states() {
        let dotset = DotSet::new();
        let a = json!({"dots": [{"owner": 1, "x": 0, "y": 0}]});
        let b = a.clone();
        assert_eq!(dotset.hash(&a), dotset.hash(&b));
    }

    #[test]
    fn command_limits_declare_place_and_clear_only() {
        let dotset = DotSet::new();
        let limits = dotset.command_limits();
        assert!(limits.allows("place"));
        assert!(limits.allows("clear"));
        assert!(!limits.allows("teleport"));
    }
}
