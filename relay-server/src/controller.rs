//! Per-connection lifecycle, rate limiting, and session bookkeeping (§4.D, §3 `Controller`).
//!
//! `NEW` connections live only in the pre-login handshake (they are not
//! represented here at all — see `src/websocket.rs`); everything past that
//! point is owned exclusively by the instance task that admitted it.

use protocol::ServerMessage;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type ControllerId = u32;
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

/// Starting and maximum chat-token balance (§5 "per-controller chat-token
/// replenishment timer"). The spec leaves the exact bucket size to the
/// implementation; chosen generously enough that normal chat use never stalls.
pub const MAX_CHAT_TOKENS: u32 = 5;
/// How long a spent chat token takes to come back.
pub const CHAT_TOKEN_REPLENISH: Duration = Duration::from_secs(3);

/// Only `LIVE` and `OUTBOX` controllers are represented by a [`ControllerRecord`];
/// `INBOX` controllers are tracked separately as a [`PendingLogin`] (§4.D) and
/// `NEW`/`DEAD` controllers don't exist as instance state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Live,
    Outbox,
}

/// A controller that has successfully logged in (LIVE) or has since
/// disconnected but whose Disconnect event has not yet crossed the past
/// horizon (OUTBOX).
pub struct ControllerRecord {
    pub id: ControllerId,
    pub username: String,
    pub remote_addr: SocketAddr,
    pub state: LifecycleState,
    /// The earliest frame at which subsequent events from this controller may
    /// be stamped (§3, §4.E step 3).
    pub min_frame_number: u32,
    pub last_command_serial: i64,
    pub rate_counters: HashMap<String, u32>,
    pub last_frame_input: Option<String>,
    pub chat_tokens: u32,
    chat_replenish_due: VecDeque<Instant>,
    pub last_activity: Instant,
    pub outbound: OutboundSender,
}

impl ControllerRecord {
    pub fn new(
        id: ControllerId,
        username: String,
        remote_addr: SocketAddr,
        min_frame_number: u32,
        now: Instant,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            id,
            username,
            remote_addr,
            state: LifecycleState::Live,
            min_frame_number,
            last_command_serial: 0,
            rate_counters: HashMap::new(),
            last_frame_input: None,
            chat_tokens: MAX_CHAT_TOKENS,
            chat_replenish_due: VecDeque::new(),
            last_activity: now,
            outbound,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether this (LIVE) controller's inactivity timeout has elapsed.
    /// OUTBOX controllers are never timed out this way — they are reaped
    /// once their Disconnect event crosses the horizon.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.state == LifecycleState::Live && now.duration_since(self.last_activity) >= timeout
    }

    /// A new frame-grouping window opened on this controller (§4.E step 8/9):
    /// reset the serial counter and the per-verb rate counters.
    pub fn open_new_window(&mut self, frame: u32) {
        self.min_frame_number = frame;
        self.last_command_serial = 0;
        self.rate_counters.clear();
    }

    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Attempts to spend one chat token; on success schedules its replenishment.
    pub fn try_spend_chat_token(&mut self, now: Instant) -> bool {
        if self.chat_tokens == 0 {
            return false;
        }
        self.chat_tokens -= 1;
        self.chat_replenish_due.push_back(now + CHAT_TOKEN_REPLENISH);
        true
    }

    /// Replenishes any chat tokens whose timer has elapsed, returning how many
    /// came back (the caller sends that many `{k:"G"}` grants, §6.3).
    pub fn poll_chat_token_replenishment(&mut self, now: Instant) -> u32 {
        let mut replenished = 0;
        while let Some(&due) = self.chat_replenish_due.front() {
            if due > now {
                break;
            }
            self.chat_replenish_due.pop_front();
            if self.chat_tokens < MAX_CHAT_TOKENS {
                self.chat_tokens += 1;
            }
            replenished += 1;
        }
        replenished
    }
}

/// A controller waiting in INBOX for a prior OUTBOX session's Disconnect to
/// cross the horizon before it can become LIVE (§4.D).
pub struct PendingLogin {
    pub controller_id: ControllerId,
    pub remote_addr: SocketAddr,
    pub outbound: OutboundSender,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(now: Instant) -> ControllerRecord {
        let (tx, _rx) = mpsc::unbounded_channel();
        ControllerRecord::new(1, "alice".into(), "127.0.0.1:1".parse().unwrap(), 10, now, tx)
    }

    #[test]
    fn new_window_clears_serial_and_rate_counters() {
        let mut c = record(Instant::now());
        c.last_command_serial = 5;
        c.rate_counters.insert("fire".into(), 3);
        c.open_new_window(20);
        assert_eq!(c.min_frame_number, 20);
        assert_eq!(c.last_command_serial, 0);
        assert!(c.rate_counters.is_empty());
    }

    #[test]
    fn timeout_only_applies_to_live_controllers() {
        let now = Instant::now();
        let mut c = record(now);
        let later = now + Duration::from_secs(10);
        assert!(c.is_timed_out(later, Duration::from_secs(5)));
        c.state = LifecycleState::Outbox;
        assert!(!c.is_timed_out(later, Duration::from_secs(5)));
    }

    #[test]
    fn chat_tokens_replenish_after_the_configured_delay() {
        let now = Instant::now();
        let mut c = record(now);
        for _ in 0..MAX_CHAT_TOKENS {
            assert!(c.try_spend_chat_token(now));
        }
        assert!(!c.try_spend_chat_token(now));
        let later = now + CHAT_TOKEN_REPLENISH + Duration::from_millis(1);
        assert_eq!(c.poll_chat_token_replenishment(later), MAX_CHAT_TOKENS);
        assert_eq!(c.chat_tokens, MAX_CHAT_TOKENS);
    }
}
