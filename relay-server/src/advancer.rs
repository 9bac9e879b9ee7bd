//! The ticking engine: sorts a frame's events, calls the playset, rolls the
//! horizon forward, and emits scheduled sync messages (§4.G).
//!
//! Relaying an admitted event to other subscribers happens immediately at
//! admission time (`validator` + `broadcaster`, wired together in
//! `websocket.rs`) — this module only ever touches the authoritative
//! past-horizon state, which always lags the present frame by
//! [`protocol::PAST_HORIZON_FRAMES`].

use crate::broadcaster;
use crate::clock::{frame_duration, next_advance_deadline};
use crate::controller::ControllerId;
use crate::event::{canonical_sort, partition, Event};
use crate::instance::Instance;
use playset::{CommandEvent, ConnectEvent, ControllerInput, DisconnectEvent};
use protocol::ControllerStatus;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    pub failed_sends: Vec<ControllerId>,
    pub frames_advanced: u32,
}

/// §4.G step 5 / §7: a frame-input event from a controller the playset never
/// saw connected. This means the canonical sort or the lifecycle state
/// machine has a bug; the instance cannot continue safely.
#[derive(Debug)]
pub struct FatalAdvanceError {
    pub instance: String,
    pub frame: u32,
    pub controller: ControllerId,
}

/// Runs every due frame advance for `instance` (the `while now >= deadline`
/// loop of §4.G), then re-evaluates the suspend condition.
pub fn tick(instance: &mut Instance, now: Instant) -> Result<AdvanceOutcome, FatalAdvanceError> {
    let mut outcome = AdvanceOutcome::default();
    while now >= next_advance_deadline(instance.past_horizon_perf_time) {
        advance_one_frame(instance, now, &mut outcome)?;
        outcome.frames_advanced += 1;
    }
    if instance.should_suspend() {
        instance.suspended = true;
    }
    Ok(outcome)
}

fn advance_one_frame(instance: &mut Instance, now: Instant, outcome: &mut AdvanceOutcome) -> Result<(), FatalAdvanceError> {
    let frame = instance.past_horizon_frame;

    // Steps 1-3.
    let mut bucket = instance.events.remove(&frame).unwrap_or_default();
    canonical_sort(&mut bucket);
    let (connects, commands, frames, disconnects) = partition(bucket);

    // Step 4: controller_status gains the member before the playset sees it.
    for event in &connects {
        if let Event::Connect { controller, username, .. } = event {
            instance
                .controller_status
                .insert(*controller, ControllerStatus { username: username.clone(), last_input_string: String::new() });
        }
    }

    // Step 5: every frame-input's controller must already be known.
    for event in &frames {
        if let Event::Frame { controller, .. } = event {
            if !instance.controller_status.contains_key(controller) {
                return Err(FatalAdvanceError { instance: instance.name.clone(), frame, controller: *controller });
            }
        }
    }

    // Step 6.
    for event in &frames {
        if let Event::Frame { controller, input, .. } = event {
            if let Some(status) = instance.controller_status.get_mut(controller) {
                status.last_input_string = input.clone();
            }
        }
    }

    // Step 7: ascending controller-id order is mandatory for determinism —
    // `controller_status` is a `BTreeMap`, so this iteration order is free.
    let inputs: Vec<ControllerInput> = instance
        .controller_status
        .iter()
        .map(|(&controller, status)| ControllerInput { controller, last_input_string: status.last_input_string.clone() })
        .collect();

    let playset_connects: Vec<ConnectEvent> = connects.iter().map(|e| ConnectEvent { controller: e.controller() }).collect();
    let playset_commands: Vec<CommandEvent> = commands
        .iter()
        .map(|e| match e {
            Event::Command { controller, serial, verb, arg, .. } => {
                CommandEvent { controller: *controller, serial: *serial, verb: verb.clone(), arg: arg.clone() }
            }
            _ => unreachable!("partition only places Command events in this bucket"),
        })
        .collect();
    let playset_disconnects: Vec<DisconnectEvent> = disconnects.iter().map(|e| DisconnectEvent { controller: e.controller() }).collect();

    // Step 8: the only point the playset is allowed to touch state.
    instance
        .playset
        .advance(&mut instance.past_horizon_state, &playset_connects, &playset_commands, &inputs, &playset_disconnects);

    // Step 9.
    for event in &disconnects {
        let Event::Disconnect { controller, .. } = event else { continue };
        let username = instance.controller_status.remove(controller).map(|s| s.username);
        instance.controllers.remove(controller);
        if let Some(username) = username {
            instance.outbox_usernames.remove(&username);
            if let Some(pending) = instance.inbox.remove(&username) {
                instance.admit_live(pending.controller_id, username, pending.remote_addr, pending.outbound, now);
            }
        }
    }

    // Step 10.
    instance.past_horizon_frame += 1;
    instance.past_horizon_perf_time += frame_duration(1);

    // Step 11: at most one of hash-sync or plain frame-advance fires per frame.
    let new_frame = instance.past_horizon_frame;
    if instance.hash_sync_interval != 0 && new_frame % instance.hash_sync_interval == 0 {
        if let Some(hash) = instance.playset.hash(&instance.past_horizon_state) {
            outcome.failed_sends.extend(broadcaster::broadcast_frame_advance(instance, new_frame, Some(hash)));
        } else if instance.frame_broadcast_interval != 0 && new_frame % instance.frame_broadcast_interval == 0 {
            outcome.failed_sends.extend(broadcaster::broadcast_frame_advance(instance, new_frame, None));
        }
    } else if instance.frame_broadcast_interval != 0 && new_frame % instance.frame_broadcast_interval == 0 {
        outcome.failed_sends.extend(broadcaster::broadcast_frame_advance(instance, new_frame, None));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerRecord;
    use dotset::DotSet;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn ticking_instance() -> Instance {
        let mut instance = Instance::rehydrate(
            "room".into(),
            Arc::new(DotSet::new()),
            DotSet::new().initial_state(),
            BTreeMap::new(),
            Instant::now(),
            protocol::DEFAULT_HASH_SYNC_INTERVAL,
            protocol::DEFAULT_FRAME_BROADCAST_INTERVAL,
        );
        instance.unsuspend(Instant::now());
        instance
    }

    #[test]
    fn advance_increments_past_horizon_frame_and_advances_clock() {
        let mut instance = ticking_instance();
        let before = instance.past_horizon_frame;
        let far_future = Instant::now() + frame_duration(1000);
        tick(&mut instance, far_future).unwrap();
        assert!(instance.past_horizon_frame > before);
    }

    #[test]
    fn connect_is_folded_into_controller_status_before_playset_sees_it() {
        let mut instance = ticking_instance();
        let frame = instance.past_horizon_frame;
        instance.admit(Event::Connect { frame, controller: 9, username: "nine".into(), profile: None });
        let far_future = Instant::now() + frame_duration(1000);
        tick(&mut instance, far_future).unwrap();
        assert_eq!(instance.controller_status.get(&9).map(|s| s.username.as_str()), Some("nine"));
    }

    #[test]
    fn unknown_controller_frame_input_is_a_fatal_error() {
        let mut instance = ticking_instance();
        let frame = instance.past_horizon_frame;
        instance.admit(Event::Frame { frame, controller: 42, input: "x".into() });
        let far_future = Instant::now() + frame_duration(1000);
        let err = tick(&mut instance, far_future).unwrap_err();
        assert_eq!(err.controller, 42);
    }

    #[test]
    fn disconnect_promotes_a_waiting_inbox_controller_to_live() {
        let mut instance = ticking_instance();
        let frame = instance.past_horizon_frame;
        instance.controller_status.insert(7, ControllerStatus { username: "alice".into(), last_input_string: String::new() });
        instance.admit(Event::Disconnect { frame, controller: 7 });
        let (tx, mut rx) = mpsc::unbounded_channel();
        instance.inbox.insert(
            "alice".into(),
            crate::controller::PendingLogin { controller_id: 8, remote_addr: "127.0.0.1:2".parse().unwrap(), outbound: tx },
        );
        let far_future = Instant::now() + frame_duration(1000);
        tick(&mut instance, far_future).unwrap();
        assert!(instance.controllers.contains_key(&8));
        assert!(instance.inbox.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), protocol::ServerMessage::Welcome { .. }));
    }

    #[test]
    fn hash_sync_fires_on_the_configured_interval() {
        let mut instance = ticking_instance();
        instance.hash_sync_interval = 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let c = ControllerRecord::new(1, "alice".into(), "127.0.0.1:1".parse().unwrap(), instance.present_frame(), Instant::now(), tx);
        instance.controllers.insert(1, c);
        let far_future = Instant::now() + frame_duration(2);
        tick(&mut instance, far_future).unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, protocol::ServerMessage::FrameAdvance { h: Some(_), .. }));
    }
}
