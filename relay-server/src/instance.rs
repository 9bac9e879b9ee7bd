//! The state a single named game world owns: past-horizon world state,
//! pending events keyed by frame, the connected-controller roster, and the
//! suspend/resume bit (§3 `Instance`, Component C).
//!
//! An `Instance` is never shared: it lives entirely inside the one task that
//! owns it (§5). Everything here is plain data plus the small helpers needed
//! to keep its invariants straight; the interesting behaviour — validating,
//! advancing, broadcasting — lives in `validator.rs`, `advancer.rs` and
//! `broadcaster.rs`.

use crate::clock::{frame_duration, present_frame, timing_pong};
use crate::controller::{ControllerId, ControllerRecord, OutboundSender, PendingLogin};
use crate::event::Event;
use playset::Playset;
use protocol::{ControllerStatus, ServerMessage};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub struct Instance {
    pub name: String,
    pub playset: Arc<dyn Playset>,
    pub past_horizon_frame: u32,
    pub past_horizon_perf_time: Instant,
    pub past_horizon_state: Value,
    /// Who was connected as of `past_horizon_frame` (§3 invariant b).
    pub controller_status: BTreeMap<ControllerId, ControllerStatus>,
    /// Pending events, keyed by frame; every entry's frame is >= `past_horizon_frame`
    /// (§3 invariant a).
    pub events: HashMap<u32, Vec<Event>>,
    /// LIVE and OUTBOX controllers, keyed by controller id.
    pub controllers: HashMap<ControllerId, ControllerRecord>,
    /// INBOX controllers waiting on a prior OUTBOX session, keyed by username.
    pub inbox: HashMap<String, PendingLogin>,
    /// Usernames with a live OUTBOX record, for O(1) "is this username free" checks.
    pub outbox_usernames: std::collections::HashSet<String>,
    pub suspended: bool,
    /// Optional server-wide overrides; `None` means use the playset/protocol default.
    pub hash_sync_interval: u32,
    pub frame_broadcast_interval: u32,
}

impl Instance {
    /// Builds a freshly-rehydrated instance per §4.C / §4.I: past horizon reset
    /// to frame 1, a Disconnect synthesised at frame 1 for every controller the
    /// snapshot says was connected, and `suspended = true`.
    pub fn rehydrate(
        name: String,
        playset: Arc<dyn Playset>,
        state: Value,
        controller_status: BTreeMap<ControllerId, ControllerStatus>,
        now: Instant,
        hash_sync_interval: u32,
        frame_broadcast_interval: u32,
    ) -> Self {
        let past_horizon_frame = 1;
        let past_horizon_perf_time = now
            .checked_sub(frame_duration(protocol::PAST_HORIZON_FRAMES))
            .unwrap_or(now);

        let mut events: HashMap<u32, Vec<Event>> = HashMap::new();
        let synthetic_disconnects: Vec<Event> = controller_status
            .keys()
            .map(|&controller| Event::Disconnect { frame: past_horizon_frame, controller })
            .collect();
        if !synthetic_disconnects.is_empty() {
            events.insert(past_horizon_frame, synthetic_disconnects);
        }

        Self {
            name,
            playset,
            past_horizon_frame,
            past_horizon_perf_time,
            past_horizon_state: state,
            controller_status,
            events,
            controllers: HashMap::new(),
            inbox: HashMap::new(),
            outbox_usernames: std::collections::HashSet::new(),
            suspended: true,
            hash_sync_interval,
            frame_broadcast_interval,
        }
    }

    pub fn present_frame(&self) -> u32 {
        present_frame(self.past_horizon_frame)
    }

    pub fn admit(&mut self, event: Event) {
        debug_assert!(event.frame() >= self.past_horizon_frame, "admitted event below past horizon");
        self.events.entry(event.frame()).or_default().push(event);
    }

    /// Whether any LIVE controller exists to receive a broadcast.
    pub fn has_live_subscribers(&self) -> bool {
        self.controllers
            .values()
            .any(|c| c.state == crate::controller::LifecycleState::Live)
    }

    pub fn live_controller_ids(&self) -> Vec<ControllerId> {
        self.controllers
            .values()
            .filter(|c| c.state == crate::controller::LifecycleState::Live)
            .map(|c| c.id)
            .collect()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// §4.G: suspend once idle (no pending events, no live subscribers).
    pub fn should_suspend(&self) -> bool {
        !self.has_pending_events() && !self.has_live_subscribers()
    }

    /// §4.G "unsuspend semantics": never let a long-idle instance burst-catch-up.
    pub fn unsuspend(&mut self, now: Instant) {
        let floor = now
            .checked_sub(frame_duration(protocol::PAST_HORIZON_FRAMES))
            .unwrap_or(now);
        if floor > self.past_horizon_perf_time {
            self.past_horizon_perf_time = floor;
        }
        self.suspended = false;
    }

    /// Whether `username` currently owns a LIVE controller.
    pub fn live_username(&self, username: &str) -> Option<ControllerId> {
        self.controllers
            .values()
            .find(|c| c.username == username && c.state == crate::controller::LifecycleState::Live)
            .map(|c| c.id)
    }

    /// Admits `controller_id` as LIVE right now: stamps a Connect event at the
    /// present frame, then synchronously sends `{k:"W"}` followed by
    /// `{k:"S"}` (§4.D, §6.3). Used both by a fresh login (no prior OUTBOX)
    /// and by the horizon advancer promoting an INBOX waiter (§4.G step 9,
    /// §8 scenario S4 — in both cases the snapshot is handed over immediately,
    /// not deferred to the next horizon tick).
    pub fn admit_live(
        &mut self,
        controller_id: ControllerId,
        username: String,
        remote_addr: SocketAddr,
        outbound: OutboundSender,
        now: Instant,
    ) {
        let frame = self.present_frame();
        let record = ControllerRecord::new(controller_id, username.clone(), remote_addr, frame, now, outbound);
        record.send(ServerMessage::Welcome { t: timing_pong(now, self.past_horizon_perf_time, self.past_horizon_frame) });
        self.controllers.insert(controller_id, record);
        self.admit(Event::Connect { frame, controller: controller_id, username, profile: None });

        let snapshot = crate::snapshot::build_snapshot(self, controller_id);
        if let Some(record) = self.controllers.get(&controller_id) {
            record.send(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotset::DotSet;

    fn test_instance(now: Instant) -> Instance {
        Instance::rehydrate(
            "room".into(),
            Arc::new(DotSet::new()),
            DotSet::new().initial_state(),
            BTreeMap::new(),
            now,
            protocol::DEFAULT_HASH_SYNC_INTERVAL,
            protocol::DEFAULT_FRAME_BROADCAST_INTERVAL,
        )
    }

    #[test]
    fn rehydration_starts_suspended_at_frame_one() {
        let instance = test_instance(Instant::now());
        assert_eq!(instance.past_horizon_frame, 1);
        assert!(instance.suspended);
        assert_eq!(instance.present_frame(), 16);
    }

    #[test]
    fn rehydration_synthesises_disconnects_for_stored_roster() {
        let mut roster = BTreeMap::new();
        roster.insert(7, ControllerStatus { username: "alice".into(), last_input_string: String::new() });
        let instance = Instance::rehydrate(
            "room".into(),
            Arc::new(DotSet::new()),
            DotSet::new().initial_state(),
            roster,
            Instant::now(),
            protocol::DEFAULT_HASH_SYNC_INTERVAL,
            protocol::DEFAULT_FRAME_BROADCAST_INTERVAL,
        );
        let bucket = instance.events.get(&1).expect("frame 1 bucket");
        assert_eq!(bucket.len(), 1);
        assert!(matches!(bucket[0], Event::Disconnect { controller: 7, .. }));
    }

    #[test]
    fn should_suspend_requires_both_no_events_and_no_subscribers() {
        let mut instance = test_instance(Instant::now());
        assert!(instance.should_suspend());
        instance.admit(Event::Frame { frame: 1, controller: 1, input: "x".into() });
        assert!(!instance.should_suspend());
    }

    #[test]
    fn admit_live_sends_welcome_then_snapshot_and_admits_a_connect() {
        let now = Instant::now();
        let mut instance = test_instance(now);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        instance.admit_live(1, "alice".into(), "127.0.0.1:1".parse().unwrap(), tx, now);

        assert!(matches!(rx.try_recv().unwrap(), protocol::ServerMessage::Welcome { .. }));
        assert!(matches!(rx.try_recv().unwrap(), protocol::ServerMessage::Snapshot { c: 1, .. }));
        assert!(instance.controllers.contains_key(&1));
        let bucket = instance.events.get(&instance.present_frame()).expect("connect admitted");
        assert!(matches!(bucket[0], Event::Connect { controller: 1, .. }));
    }

    #[test]
    fn unsuspend_never_bursts_past_the_catchup_floor() {
        let now = Instant::now();
        let mut instance = test_instance(now);
        // Simulate long idleness: perf time far in the past.
        instance.past_horizon_perf_time = now - std::time::Duration::from_secs(3600);
        instance.unsuspend(now);
        let floor = now - frame_duration(protocol::PAST_HORIZON_FRAMES);
        assert_eq!(instance.past_horizon_perf_time, floor);
    }
}
