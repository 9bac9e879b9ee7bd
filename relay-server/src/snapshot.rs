//! Whole-server JSON dumps and the initial-state message handed to a
//! freshly-LIVE controller (§4.I, §6.6).

use crate::controller::ControllerId;
use crate::error::SnapshotError;
use crate::instance::Instance;
use crate::users::User;
use protocol::{ControllerStatus, FRAME_RATE, MAX_CHAT_MESSAGE_BYTES};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One instance's persisted state (§6.6). `state` may be a string (opaque,
/// round-tripped through the playset's own serializer) or an inline JSON
/// object — a convenience for hand-authored seed files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    #[serde(rename = "playsetName")]
    pub playset_name: String,
    pub state: Value,
    #[serde(rename = "controllerStatus")]
    pub controller_status: BTreeMap<ControllerId, ControllerStatus>,
}

/// The whole-server persistence file (§6.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub config: Value,
    pub users: BTreeMap<String, User>,
    #[serde(rename = "nextControllerID")]
    pub next_controller_id: ControllerId,
    pub instances: BTreeMap<String, InstanceSnapshot>,
}

pub fn load(path: &Path) -> Result<ServerSnapshot, SnapshotError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Writes `snapshot` to `path`, creating parent directories as needed.
fn write_to(snapshot: &ServerSnapshot, path: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let text = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, text)?;
    Ok(())
}

fn forensic_path(canonical: &Path) -> std::path::PathBuf {
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let stem = canonical.file_stem().and_then(|s| s.to_str()).unwrap_or("snapshot");
    let ext = canonical.extension().and_then(|s| s.to_str()).unwrap_or("json");
    canonical.with_file_name(format!("{stem}.{stamp}.{ext}"))
}

/// `cleanShutdown` writes both the timestamped backup and the canonical path (§4.I).
pub fn clean_shutdown(snapshot: &ServerSnapshot, canonical: &Path) -> Result<(), SnapshotError> {
    write_to(snapshot, &forensic_path(canonical))?;
    write_to(snapshot, canonical)
}

/// `dirtyShutdown` writes only the timestamped forensic copy (§4.I) — the
/// canonical path is left untouched so a corrupted in-memory state never
/// overwrites the last known-good snapshot.
pub fn dirty_shutdown(snapshot: &ServerSnapshot, canonical: &Path) -> Result<(), SnapshotError> {
    write_to(snapshot, &forensic_path(canonical))
}

/// Builds the `{k:"S"}` initial snapshot for `controller_id` (§6.3).
pub fn build_snapshot(instance: &Instance, controller_id: ControllerId) -> protocol::ServerMessage {
    let chat_tokens = instance.controllers.get(&controller_id).map(|c| c.chat_tokens).unwrap_or(0);
    let mut pending: Vec<Value> = Vec::new();
    for bucket in instance.events.values() {
        for event in bucket {
            pending.push(serde_json::to_value(EventWire::from(event)).expect("events serialize"));
        }
    }
    protocol::ServerMessage::Snapshot {
        p: instance.playset.name().to_string(),
        c: controller_id,
        x: instance.controller_status.clone(),
        g: instance.playset.serialize(&instance.past_horizon_state),
        f: instance.past_horizon_frame,
        e: pending,
        r: FRAME_RATE,
        l: MAX_CHAT_MESSAGE_BYTES,
        m: chat_tokens,
    }
}

/// A plain-data mirror of [`crate::event::Event`] for the snapshot's `e` field;
/// clients replay these against their own local copy of `past_horizon_state`.
#[derive(Serialize)]
#[serde(tag = "k")]
enum EventWire {
    #[serde(rename = "c")]
    Connect { f: u32, c: u32, u: String },
    #[serde(rename = "o")]
    Command { f: u32, c: u32, s: u32, o: String, a: Option<String> },
    #[serde(rename = "f")]
    Frame { f: u32, c: u32, i: String },
    #[serde(rename = "d")]
    Disconnect { f: u32, c: u32 },
}

impl From<&crate::event::Event> for EventWire {
    fn from(event: &crate::event::Event) -> Self {
        match event {
            crate::event::Event::Connect { frame, controller, username, .. } => {
                EventWire::Connect { f: *frame, c: *controller, u: username.clone() }
            }
            crate::event::Event::Command { frame, controller, serial, verb, arg } => {
                EventWire::Command { f: *frame, c: *controller, s: *serial, o: verb.clone(), a: arg.clone() }
            }
            crate::event::Event::Frame { frame, controller, input } => {
                EventWire::Frame { f: *frame, c: *controller, i: input.clone() }
            }
            crate::event::Event::Disconnect { frame, controller } => {
                EventWire::Disconnect { f: *frame, c: *controller }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotset::DotSet;
    use std::sync::Arc;

    #[test]
    fn forensic_path_keeps_the_original_extension() {
        let canonical = Path::new("/var/lib/relay/snapshot.json");
        let forensic = forensic_path(canonical);
        assert!(forensic.to_string_lossy().ends_with(".json"));
        assert!(forensic.to_string_lossy().contains("snapshot."));
    }

    #[test]
    fn build_snapshot_reports_pending_events_unsorted() {
        let mut instance = Instance::rehydrate(
            "room".into(),
            Arc::new(DotSet::new()),
            DotSet::new().initial_state(),
            BTreeMap::new(),
            std::time::Instant::now(),
            protocol::DEFAULT_HASH_SYNC_INTERVAL,
            protocol::DEFAULT_FRAME_BROADCAST_INTERVAL,
        );
        instance.admit(crate::event::Event::Frame { frame: 3, controller: 1, input: "x".into() });
        let msg = build_snapshot(&instance, 1);
        match msg {
            protocol::ServerMessage::Snapshot { e, f, .. } => {
                assert_eq!(f, 1);
                assert_eq!(e.len(), 1);
            }
            _ => panic!("expected Snapshot"),
        }
    }
}
