//! Fans out admitted events, frame-advance notices, and timing pongs to
//! subscribed controllers (§4.F).
//!
//! Every function here returns the ids of controllers whose send failed
//! instead of acting on them directly — only the instance's owning task may
//! mutate `controllers` (§5), so closing a dead connection is the caller's
//! job, not this module's.

use crate::clock::timing_pong;
use crate::controller::{ControllerId, LifecycleState};
use crate::event::Event;
use crate::instance::Instance;
use protocol::ServerMessage;
use std::time::Instant;

fn to_relay_message(event: &Event, pong: Option<i64>) -> ServerMessage {
    match event {
        Event::Connect { frame, controller, username, .. } => {
            ServerMessage::ConnectRelay { f: *frame, c: *controller, u: username.clone() }
        }
        Event::Command { frame, controller, serial, verb, arg } => {
            ServerMessage::CommandRelay { f: *frame, c: *controller, s: *serial, o: verb.clone(), a: arg.clone() }
        }
        Event::Frame { frame, controller, input } => {
            ServerMessage::FrameRelay { f: *frame, c: *controller, i: input.clone(), t: pong }
        }
        Event::Disconnect { frame, controller } => ServerMessage::DisconnectRelay { f: *frame, c: *controller },
    }
}

/// Fans `event` out to every LIVE subscriber. When `echo_only` is set (a Frame
/// event whose input string duplicated the controller's previous one, §4.E
/// step 6) only the sender receives a copy. The sender's own copy of a Frame
/// event always carries a freshly computed timing pong; every other
/// recipient's copy carries none.
pub fn relay_event(instance: &Instance, event: &Event, echo_only: bool, now: Instant) -> Vec<ControllerId> {
    let sender = event.controller();
    let mut failed = Vec::new();
    for record in instance.controllers.values() {
        if record.state != LifecycleState::Live {
            continue;
        }
        if echo_only && record.id != sender {
            continue;
        }
        let msg = if record.id == sender {
            let pong = timing_pong(now, instance.past_horizon_perf_time, instance.past_horizon_frame);
            to_relay_message(event, Some(pong))
        } else {
            to_relay_message(event, None)
        };
        if !record.send(msg) {
            failed.push(record.id);
        }
    }
    failed
}

/// §4.G step 11: a scheduled frame-advance or hash-sync notice.
pub fn broadcast_frame_advance(instance: &Instance, frame: u32, hash: Option<i64>) -> Vec<ControllerId> {
    let mut failed = Vec::new();
    for record in instance.controllers.values() {
        if record.state != LifecycleState::Live {
            continue;
        }
        if !record.send(ServerMessage::FrameAdvance { f: frame, h: hash }) {
            failed.push(record.id);
        }
    }
    failed
}

/// Global chat fan-out (§5 "global chat fan-out"); not gated by the per-frame
/// event pipeline at all, only by the sender's chat-token bucket (`validator::validate_chat`).
pub fn broadcast_chat(instance: &Instance, controller: ControllerId, username: &str, message: &str) -> Vec<ControllerId> {
    let mut failed = Vec::new();
    for record in instance.controllers.values() {
        if record.state != LifecycleState::Live {
            continue;
        }
        if !record.send(ServerMessage::ChatRelay { c: controller, u: username.to_string(), m: message.to_string() }) {
            failed.push(record.id);
        }
    }
    failed
}
