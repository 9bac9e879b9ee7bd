//! Parses and admits/rejects client messages against per-controller and
//! per-instance invariants (§4.E). Every public function here assumes its
//! controller is already LIVE — the pre-login and INBOX cases never reach
//! this module (§4.K).
//!
//! Functions take the instance's `past_horizon_frame`/`present_frame`/limits
//! as plain values rather than `&Instance` — the caller always holds
//! `controller` borrowed out of `instance.controllers`, and threading a
//! second borrow of all of `instance` through here would fight the
//! borrow checker for no reason.

use crate::controller::ControllerRecord;
use crate::error::ProtocolError;
use crate::event::Event;
use playset::CommandLimits;
use protocol::{FUTURE_HORIZON_FRAMES, MAX_CHAT_MESSAGE_BYTES};
use std::time::Instant;

/// The outcome of validating one inbound frame/command. `Dropped` is not an
/// error: a lagged message is discarded without reply (§4.E step 5, §7).
pub enum Admission {
    Dropped,
    Frame { event: Event, echo_only: bool },
    Command { event: Event },
}

/// Steps 3-4: the frame must be within `[controller.min_frame_number, present + FUTURE_HORIZON_FRAMES]`.
fn check_window(present_frame: u32, controller: &ControllerRecord, frame: i64) -> Result<u32, ProtocolError> {
    if frame < controller.min_frame_number as i64 {
        return Err(ProtocolError::OutOfOrder { frame, min: controller.min_frame_number });
    }
    let limit = present_frame + FUTURE_HORIZON_FRAMES;
    if frame > limit as i64 {
        return Err(ProtocolError::TooFast { frame, limit });
    }
    Ok(frame as u32)
}

/// Validates and, on success, admits a `{k:"f"}` frame-input event (§4.E steps 2,3,4,5,6,9).
pub fn validate_frame(
    past_horizon_frame: u32,
    present_frame: u32,
    max_input_len: usize,
    controller: &mut ControllerRecord,
    now: Instant,
    frame: i64,
    input: String,
) -> Result<Admission, ProtocolError> {
    if frame < past_horizon_frame as i64 {
        return Ok(Admission::Dropped);
    }
    let frame = check_window(present_frame, controller, frame)?;

    if input.len() > max_input_len {
        return Err(ProtocolError::InputTooLong);
    }

    let echo_only = controller.last_frame_input.as_deref() == Some(input.as_str());
    let event = Event::Frame { frame, controller: controller.id, input: input.clone() };

    // Step 9: admission opens a fresh window.
    controller.last_frame_input = Some(input);
    controller.min_frame_number = frame + 1;
    controller.rate_counters.clear();
    controller.last_command_serial = 0;
    controller.touch(now);

    Ok(Admission::Frame { event, echo_only })
}

/// Validates and, on success, admits a `{k:"o"}` command event (§4.E steps 2,3,4,5,7,8).
pub fn validate_command(
    past_horizon_frame: u32,
    present_frame: u32,
    limits: &CommandLimits,
    controller: &mut ControllerRecord,
    now: Instant,
    frame: i64,
    serial: i64,
    verb: String,
    arg: Option<String>,
) -> Result<Admission, ProtocolError> {
    if frame < past_horizon_frame as i64 {
        return Ok(Admission::Dropped);
    }
    let frame = check_window(present_frame, controller, frame)?;

    if !limits.allows(&verb) {
        return Err(ProtocolError::UnknownVerb(verb));
    }
    if let Some(a) = &arg {
        if a.len() > limits.max_arg_len {
            return Err(ProtocolError::ArgTooLong);
        }
    }

    // Step 8: a new frame's window opens on this controller before the serial
    // and rate counters below are checked.
    if frame > controller.min_frame_number {
        controller.open_new_window(frame);
    }

    if serial <= 0 || serial <= controller.last_command_serial as i64 {
        return Err(ProtocolError::SerialNotIncreasing { serial, last: controller.last_command_serial });
    }

    let cap = limits.rate_cap(&verb).unwrap_or(0);
    let used = controller.rate_counters.entry(verb.clone()).or_insert(0);
    if *used >= cap {
        return Err(ProtocolError::RateExceeded(verb));
    }
    *used += 1;
    controller.last_command_serial = serial as u32;
    controller.touch(now);

    Ok(Admission::Command {
        event: Event::Command { frame, controller: controller.id, serial: serial as u32, verb, arg },
    })
}

/// Validates and, on success, spends one chat token for a `{k:"g"}` message.
/// Not part of the frame/command cascade (§4.E is scoped to `f`/`o` only) but
/// governed by the same per-controller rate-limiting posture (§7).
pub fn validate_chat(controller: &mut ControllerRecord, now: Instant, message: &str) -> Result<(), ProtocolError> {
    if message.len() > MAX_CHAT_MESSAGE_BYTES {
        return Err(ProtocolError::ChatTooLong);
    }
    if !controller.try_spend_chat_token(now) {
        return Err(ProtocolError::ChatTooFast);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotset::DotSet;
    use playset::Playset;
    use tokio::sync::mpsc;

    fn limits() -> CommandLimits {
        DotSet::new().command_limits()
    }

    fn controller(min_frame_number: u32) -> ControllerRecord {
        let (tx, _rx) = mpsc::unbounded_channel();
        ControllerRecord::new(1, "alice".into(), "127.0.0.1:1".parse().unwrap(), min_frame_number, Instant::now(), tx)
    }

    #[test]
    fn frame_below_past_horizon_is_silently_dropped() {
        let mut c = controller(105);
        let outcome = validate_frame(100, 115, 64, &mut c, Instant::now(), 95, "x".into()).unwrap();
        assert!(matches!(outcome, Admission::Dropped));
    }

    #[test]
    fn frame_below_controller_minimum_is_out_of_order() {
        let mut c = controller(10);
        let err = validate_frame(1, 16, 64, &mut c, Instant::now(), 5, "x".into()).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfOrder { frame: 5, min: 10 }));
    }

    #[test]
    fn frame_past_future_horizon_is_too_fast() {
        let mut c = controller(1);
        let err = validate_frame(1, 16, 64, &mut c, Instant::now(), 1000, "x".into()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooFast { .. }));
    }

    #[test]
    fn accepted_frame_opens_next_window() {
        let mut c = controller(1);
        c.last_command_serial = 9;
        c.rate_counters.insert("place".into(), 3);
        let outcome = validate_frame(1, 16, 64, &mut c, Instant::now(), 20, "x,y".into()).unwrap();
        assert!(matches!(outcome, Admission::Frame { echo_only: false, .. }));
        assert_eq!(c.min_frame_number, 21);
        assert_eq!(c.last_command_serial, 0);
        assert!(c.rate_counters.is_empty());
    }

    #[test]
    fn repeated_identical_input_is_echo_only() {
        let mut c = controller(1);
        validate_frame(1, 16, 64, &mut c, Instant::now(), 20, "same".into()).unwrap();
        let outcome = validate_frame(1, 16, 64, &mut c, Instant::now(), 21, "same".into()).unwrap();
        assert!(matches!(outcome, Admission::Frame { echo_only: true, .. }));
    }

    #[test]
    fn command_serial_must_strictly_increase() {
        let caps = limits();
        let mut c = controller(1);
        let ok = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 1, "place".into(), Some("1,1".into()));
        assert!(matches!(ok, Ok(Admission::Command { .. })));
        let zero = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 0, "place".into(), None);
        assert!(matches!(zero, Err(ProtocolError::SerialNotIncreasing { .. })));
        let repeat = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 1, "place".into(), None);
        assert!(matches!(repeat, Err(ProtocolError::SerialNotIncreasing { .. })));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        let caps = limits();
        let mut c = controller(1);
        let err = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 1, "teleport".into(), None).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownVerb(v) if v == "teleport"));
    }

    #[test]
    fn rate_cap_is_enforced_within_a_window() {
        let caps = limits();
        let mut c = controller(1);
        let outcome = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 1, "clear".into(), None);
        assert!(matches!(outcome, Ok(Admission::Command { .. })));
        let err = validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 2, "clear".into(), None).unwrap_err();
        assert!(matches!(err, ProtocolError::RateExceeded(v) if v == "clear"));
    }

    #[test]
    fn serial_resets_when_a_new_frame_window_opens() {
        let caps = limits();
        let mut c = controller(1);
        validate_command(1, 16, &caps, &mut c, Instant::now(), 20, 5, "place".into(), Some("1,1".into())).unwrap();
        // A later frame number opens a new window; serial 1 is valid again.
        let outcome = validate_command(1, 16, &caps, &mut c, Instant::now(), 21, 1, "place".into(), Some("1,2".into()));
        assert!(matches!(outcome, Ok(Admission::Command { .. })));
    }

    #[test]
    fn chat_enforces_length_and_token_bucket() {
        let mut c = controller(1);
        let now = Instant::now();
        let too_long = "x".repeat(MAX_CHAT_MESSAGE_BYTES + 1);
        assert!(matches!(validate_chat(&mut c, now, &too_long), Err(ProtocolError::ChatTooLong)));
        for _ in 0..crate::controller::MAX_CHAT_TOKENS {
            assert!(validate_chat(&mut c, now, "hi").is_ok());
        }
        assert!(matches!(validate_chat(&mut c, now, "hi"), Err(ProtocolError::ChatTooFast)));
    }
}
