//! The event variants and the canonical total order used by the horizon
//! advancer to sort one frame's bucket before calling the playset (§3, §4.G).

use serde_json::Value;
use std::cmp::Ordering;

/// One admitted event, always carrying the frame it was stamped at.
///
/// Controller and serial are integers, never strings — §9 calls out
/// stringly-typed integer keys as a pitfall to avoid, and the canonical sort
/// below depends on genuine integer comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect { frame: u32, controller: u32, username: String, profile: Option<Value> },
    Command { frame: u32, controller: u32, serial: u32, verb: String, arg: Option<String> },
    Frame { frame: u32, controller: u32, input: String },
    Disconnect { frame: u32, controller: u32 },
}

/// Rank used as the primary sort key: Connect < Command < Frame < Disconnect (§3).
fn kind_rank(event: &Event) -> u8 {
    match event {
        Event::Connect { .. } => 0,
        Event::Command { .. } => 1,
        Event::Frame { .. } => 2,
        Event::Disconnect { .. } => 3,
    }
}

impl Event {
    pub fn frame(&self) -> u32 {
        match self {
            Event::Connect { frame, .. }
            | Event::Command { frame, .. }
            | Event::Frame { frame, .. }
            | Event::Disconnect { frame, .. } => *frame,
        }
    }

    pub fn controller(&self) -> u32 {
        match self {
            Event::Connect { controller, .. }
            | Event::Command { controller, .. }
            | Event::Frame { controller, .. }
            | Event::Disconnect { controller, .. } => *controller,
        }
    }

    /// The sort key used within one frame bucket: `(kind, controller, serial)`.
    /// Only `Command` events carry a meaningful serial; everything else sorts
    /// as if its serial were zero, which is harmless because the kind/controller
    /// keys already separate them from any command with the same controller.
    fn sort_key(&self) -> (u8, u32, u32) {
        let serial = match self {
            Event::Command { serial, .. } => *serial,
            _ => 0,
        };
        (kind_rank(self), self.controller(), serial)
    }

    /// Whether two events collide under the "no duplicate" rule (§3): same
    /// kind, same controller, same frame, and — for commands — same serial.
    pub fn duplicates(&self, other: &Event) -> bool {
        self.frame() == other.frame() && self.sort_key() == other.sort_key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order **within a single frame's bucket** (§3). Comparing events from
/// different frames is well-defined (it falls back to kind/controller/serial)
/// but carries no meaning the advancer relies on — callers must always sort
/// an already-frame-filtered bucket.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Sorts a frame's event bucket into canonical order (§3, §4.G step 2).
pub fn canonical_sort(bucket: &mut [Event]) {
    bucket.sort();
}

/// Splits an already-sorted bucket into the four canonically-ordered
/// sequences the advancer hands to the playset (§4.G step 3).
pub fn partition(bucket: Vec<Event>) -> (Vec<Event>, Vec<Event>, Vec<Event>, Vec<Event>) {
    let mut connects = Vec::new();
    let mut commands = Vec::new();
    let mut frames = Vec::new();
    let mut disconnects = Vec::new();
    for event in bucket {
        match event {
            Event::Connect { .. } => connects.push(event),
            Event::Command { .. } => commands.push(event),
            Event::Frame { .. } => frames.push(event),
            Event::Disconnect { .. } => disconnects.push(event),
        }
    }
    (connects, commands, frames, disconnects)
}
