//! The top-level, explicitly-owned server object: the user store, the
//! playset registry, per-instance task handles, and the shared config (§9
//! "reframe shared mutable singletons as long-lived owning references held by
//! a top-level server object, passed explicitly" — never an ambient global).
//!
//! Each instance runs as its own cooperative `tokio` task (§5): this module
//! owns the `Instance` value for the lifetime of that task and only ever
//! exposes it to the rest of the server through an [`InstanceCommand`] channel.

use crate::advancer;
use crate::broadcaster;
use crate::clock::{next_advance_deadline, timing_pong};
use crate::config::ServerConfig;
use crate::controller::{ControllerId, LifecycleState, OutboundSender, PendingLogin};
use crate::error::{ProtocolError, SnapshotError};
use crate::event::Event;
use crate::instance::Instance;
use crate::snapshot::{InstanceSnapshot, ServerSnapshot};
use crate::users::UserStore;
use crate::validator;
use playset::registry::PlaysetRegistry;
use protocol::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
struct ChatBroadcast {
    controller: ControllerId,
    username: String,
    message: String,
}

enum InstanceCommand {
    Login {
        controller_id: ControllerId,
        username: String,
        remote_addr: SocketAddr,
        outbound: OutboundSender,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Inbound {
        controller_id: ControllerId,
        message: ClientMessage,
    },
    Disconnect {
        controller_id: ControllerId,
    },
    Snapshot {
        reply: oneshot::Sender<InstanceSnapshot>,
    },
}

#[derive(Clone)]
pub struct InstanceHandle {
    name: String,
    tx: mpsc::UnboundedSender<InstanceCommand>,
}

impl InstanceHandle {
    pub async fn login(
        &self,
        controller_id: ControllerId,
        username: String,
        remote_addr: SocketAddr,
        outbound: OutboundSender,
    ) -> Result<(), ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(InstanceCommand::Login { controller_id, username, remote_addr, outbound, reply: reply_tx });
        reply_rx.await.unwrap_or(Err(ProtocolError::NoSuchInstance(self.name.clone())))
    }

    pub fn inbound(&self, controller_id: ControllerId, message: ClientMessage) {
        let _ = self.tx.send(InstanceCommand::Inbound { controller_id, message });
    }

    pub fn disconnect(&self, controller_id: ControllerId) {
        let _ = self.tx.send(InstanceCommand::Disconnect { controller_id });
    }

    pub async fn snapshot(&self) -> Option<InstanceSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(InstanceCommand::Snapshot { reply: reply_tx }).ok()?;
        reply_rx.await.ok()
    }
}

pub struct Server {
    pub users: Arc<UserStore>,
    pub playsets: Arc<PlaysetRegistry>,
    pub config: RwLock<ServerConfig>,
    instances: RwLock<HashMap<String, InstanceHandle>>,
    chat: broadcast::Sender<ChatBroadcast>,
    next_controller_id: AtomicU32,
}

impl Server {
    pub fn new(users: UserStore, playsets: PlaysetRegistry, config: ServerConfig, next_controller_id: ControllerId) -> Arc<Self> {
        let (chat_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            users: Arc::new(users),
            playsets: Arc::new(playsets),
            config: RwLock::new(config),
            instances: RwLock::new(HashMap::new()),
            chat: chat_tx,
            next_controller_id: AtomicU32::new(next_controller_id),
        })
    }

    pub fn alloc_controller_id(&self) -> ControllerId {
        self.next_controller_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn instance_names(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn instance(&self, name: &str) -> Result<InstanceHandle, ProtocolError> {
        self.instances.read().await.get(name).cloned().ok_or_else(|| ProtocolError::NoSuchInstance(name.to_string()))
    }

    /// Spawns a fresh instance task, rehydrated from `snapshot` when given
    /// (§4.C/§4.I), else starting from the playset's own initial state.
    pub async fn spawn_instance(&self, name: String, playset_name: &str, snapshot: Option<InstanceSnapshot>) -> Result<(), SnapshotError> {
        let playset = self
            .playsets
            .get(playset_name)
            .ok_or_else(|| SnapshotError::UnknownPlayset(name.clone(), playset_name.to_string()))?;

        let config = self.config.read().await;
        let hash_sync_interval = config.hash_sync_interval;
        let frame_broadcast_interval = config.frame_broadcast_interval;
        drop(config);

        let (state, controller_status) = match snapshot {
            // A string is the opaque, playset-serialized form; anything else
            // is an already-deserialised inline seed and is used as-is (§4.I, §6.6).
            Some(s) => {
                let state = match &s.state {
                    serde_json::Value::String(_) => playset.deserialize(&s.state),
                    other => other.clone(),
                };
                (state, s.controller_status)
            }
            None => (playset.initial_state(), Default::default()),
        };

        let instance = Instance::rehydrate(name.clone(), playset, state, controller_status, Instant::now(), hash_sync_interval, frame_broadcast_interval);

        let (tx, rx) = mpsc::unbounded_channel();
        let chat_rx = self.chat.subscribe();
        tokio::spawn(run_instance(instance, rx, chat_rx, self.chat.clone()));
        self.instances.write().await.insert(name.clone(), InstanceHandle { name, tx });
        Ok(())
    }

    /// Authenticates `username`/`password`, then hands the login off to
    /// instance `instance_name` (§4.K). The instance task itself decides
    /// LIVE vs INBOX vs `AlreadyLoggedIn` (§4.D).
    pub async fn login(
        &self,
        controller_id: ControllerId,
        username: String,
        password: &str,
        instance_name: &str,
        remote_addr: SocketAddr,
        outbound: OutboundSender,
    ) -> Result<InstanceHandle, ProtocolError> {
        self.users.authenticate(&username, password).await?;
        let handle = self.instance(instance_name).await?;
        handle.login(controller_id, username, remote_addr, outbound).await?;
        Ok(handle)
    }

    /// Builds the whole-server persistence snapshot (§6.6). Instance state is
    /// read by asking each instance task for a point-in-time copy; instances
    /// that don't answer within the call are skipped (shutdown path only).
    pub async fn build_snapshot(&self) -> ServerSnapshot {
        let mut instances = HashMap::new();
        for (name, handle) in self.instances.read().await.iter() {
            if let Some(snapshot) = handle.snapshot().await {
                instances.insert(name.clone(), snapshot);
            } else {
                warn!(instance = %name, "instance did not answer snapshot request, omitting from save");
            }
        }
        ServerSnapshot {
            config: serde_json::to_value(&*self.config.read().await).unwrap_or_default(),
            users: self.users.snapshot().await.into_iter().collect(),
            next_controller_id: self.next_controller_id.load(Ordering::Relaxed),
            instances,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}

/// How often the instance loop checks per-controller inactivity timeouts and
/// polls chat-token replenishment (§5). Not tied to the frame rate at all —
/// just frequent enough that a 5s timeout is never late by more than a second.
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

async fn run_instance(
    mut instance: Instance,
    mut rx: mpsc::UnboundedReceiver<InstanceCommand>,
    mut chat_rx: broadcast::Receiver<ChatBroadcast>,
    chat_tx: broadcast::Sender<ChatBroadcast>,
) {
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);
    loop {
        let deadline = if instance.suspended { None } else { Some(next_advance_deadline(instance.past_horizon_perf_time)) };

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut instance, cmd, &chat_tx),
                    None => {
                        info!(instance = %instance.name, "instance channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = sleep_until_opt(deadline) => {
                let now = Instant::now();
                match advancer::tick(&mut instance, now) {
                    Ok(outcome) => {
                        for id in outcome.failed_sends {
                            instance.controllers.remove(&id);
                        }
                    }
                    Err(fatal) => {
                        error!(instance = %fatal.instance, frame = fatal.frame, controller = fatal.controller, "fatal invariant violated during advance, halting instance");
                        break;
                    }
                }
            }
            chat = chat_rx.recv() => {
                match chat {
                    Ok(chat) => { broadcaster::broadcast_chat(&instance, chat.controller, &chat.username, &chat.message); }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(instance = %instance.name, skipped, "chat broadcast receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = housekeeping.tick() => run_housekeeping(&mut instance, Instant::now()),
        }
    }
}

/// Per-instance-loop timer work (§5): reap LIVE controllers that have gone
/// quiet past [`protocol::CONTROLLER_TIMEOUT_SECS`], and hand out `{k:"G"}`
/// grants for chat tokens whose replenishment delay has elapsed.
fn run_housekeeping(instance: &mut Instance, now: Instant) {
    let timeout = Duration::from_secs(protocol::CONTROLLER_TIMEOUT_SECS);
    let timed_out: Vec<ControllerId> = instance
        .controllers
        .iter()
        .filter(|(_, record)| record.is_timed_out(now, timeout))
        .map(|(&id, _)| id)
        .collect();
    for id in timed_out {
        disconnect(instance, id, now);
    }

    for record in instance.controllers.values_mut() {
        for _ in 0..record.poll_chat_token_replenishment(now) {
            record.send(ServerMessage::ChatTokenGrant);
        }
    }
}

fn handle_command(instance: &mut Instance, cmd: InstanceCommand, chat_tx: &broadcast::Sender<ChatBroadcast>) {
    let now = Instant::now();
    if instance.suspended {
        instance.unsuspend(now);
    }
    match cmd {
        InstanceCommand::Login { controller_id, username, remote_addr, outbound, reply } => {
            let outcome = login_into_instance(instance, controller_id, username, remote_addr, outbound, now);
            let _ = reply.send(outcome);
        }
        InstanceCommand::Inbound { controller_id, message } => dispatch_inbound(instance, controller_id, message, now, chat_tx),
        InstanceCommand::Disconnect { controller_id } => disconnect(instance, controller_id, now),
        InstanceCommand::Snapshot { reply } => {
            let snapshot = InstanceSnapshot {
                playset_name: instance.playset.name().to_string(),
                state: instance.playset.serialize(&instance.past_horizon_state),
                controller_status: instance.controller_status.clone(),
            };
            let _ = reply.send(snapshot);
        }
    }
}

fn login_into_instance(
    instance: &mut Instance,
    controller_id: ControllerId,
    username: String,
    remote_addr: SocketAddr,
    outbound: OutboundSender,
    now: Instant,
) -> Result<(), ProtocolError> {
    if instance.live_username(&username).is_some() {
        return Err(ProtocolError::AlreadyLoggedIn(username));
    }
    if instance.outbox_usernames.contains(&username) {
        let pong = timing_pong(now, instance.past_horizon_perf_time, instance.past_horizon_frame);
        let _ = outbound.send(ServerMessage::Welcome { t: pong });
        instance.inbox.insert(username, PendingLogin { controller_id, remote_addr, outbound });
    } else {
        instance.admit_live(controller_id, username, remote_addr, outbound, now);
    }
    Ok(())
}

/// A validation failure closes the connection (§4.E, §7): send the `{k:"E"}`
/// message, then remove the controller's record so its `OutboundSender` drops
/// — `websocket.rs`'s outbound loop sees the channel close once the error is
/// drained and tears the socket down. The controller is treated exactly like
/// a disconnect for lockstep purposes: its username frees up only once its
/// Disconnect event crosses the horizon.
fn reject(instance: &mut Instance, controller_id: ControllerId, err: ProtocolError) {
    let Some(record) = instance.controllers.remove(&controller_id) else { return };
    record.send(ServerMessage::Error { e: err.to_string() });
    if record.state == LifecycleState::Live {
        instance.outbox_usernames.insert(record.username.clone());
        let frame = instance.present_frame();
        instance.admit(Event::Disconnect { frame, controller: controller_id });
    }
}

fn dispatch_inbound(
    instance: &mut Instance,
    controller_id: ControllerId,
    message: ClientMessage,
    now: Instant,
    chat_tx: &broadcast::Sender<ChatBroadcast>,
) {
    match message {
        ClientMessage::Frame { f, i } => {
            let max_len = instance.playset.max_input_len();
            let past_horizon = instance.past_horizon_frame;
            let present = instance.present_frame();
            let Some(controller) = instance.controllers.get_mut(&controller_id) else { return };
            if controller.state != LifecycleState::Live {
                return;
            }
            match validator::validate_frame(past_horizon, present, max_len, controller, now, f, i) {
                Ok(validator::Admission::Dropped) => {}
                Ok(validator::Admission::Frame { event, echo_only }) => {
                    broadcaster::relay_event(instance, &event, echo_only, now);
                    instance.admit(event);
                }
                Ok(validator::Admission::Command { .. }) => unreachable!("validate_frame never returns Admission::Command"),
                Err(err) => reject(instance, controller_id, err),
            }
        }
        ClientMessage::Command { f, s, o, a } => {
            let limits = instance.playset.command_limits();
            let past_horizon = instance.past_horizon_frame;
            let present = instance.present_frame();
            let Some(controller) = instance.controllers.get_mut(&controller_id) else { return };
            if controller.state != LifecycleState::Live {
                return;
            }
            match validator::validate_command(past_horizon, present, &limits, controller, now, f, s, o, a) {
                Ok(validator::Admission::Dropped) => {}
                Ok(validator::Admission::Command { event }) => {
                    broadcaster::relay_event(instance, &event, false, now);
                    instance.admit(event);
                }
                Ok(validator::Admission::Frame { .. }) => unreachable!("validate_command never returns Admission::Frame"),
                Err(err) => reject(instance, controller_id, err),
            }
        }
        ClientMessage::Chat { m } => {
            let Some(controller) = instance.controllers.get_mut(&controller_id) else { return };
            if controller.state != LifecycleState::Live {
                return;
            }
            match validator::validate_chat(controller, now, &m) {
                Ok(()) => {
                    let username = controller.username.clone();
                    // Fan-out to every instance's subscribers (this one included)
                    // goes through the shared broadcast channel, not a direct call
                    // (§5 "global chat fan-out ... one-way enqueue into every
                    // instance's loop").
                    let _ = chat_tx.send(ChatBroadcast { controller: controller_id, username, message: m });
                }
                Err(err) => reject(instance, controller_id, err),
            }
        }
        _ => {
            // Prelogin/login/peripheral-API messages never reach an instance
            // task; `websocket.rs` handles them against `Server` directly.
        }
    }
}

fn disconnect(instance: &mut Instance, controller_id: ControllerId, now: Instant) {
    instance.inbox.retain(|_, pending| pending.controller_id != controller_id);

    let Some(record) = instance.controllers.get_mut(&controller_id) else { return };
    if record.state != LifecycleState::Live {
        return;
    }
    record.state = LifecycleState::Outbox;
    let username = record.username.clone();
    instance.outbox_usernames.insert(username);

    let frame = instance.present_frame();
    instance.admit(Event::Disconnect { frame, controller: controller_id });
}
