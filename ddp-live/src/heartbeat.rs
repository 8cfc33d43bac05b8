//! Application-level ping/pong liveness.
//!
//! ```text
//!   inbound msg ──► reset ─────────────┐
//!                                      ▼
//!   idle ≥ interval ──► send ping ──► waiting
//!                                      │
//!   no inbound within timeout ─────────┴──► timed out
//! ```
//!
//! Any inbound message counts as a pong. Driven by explicit `now` values so
//! both the client loop and server sessions can share it.

use std::time::Duration;

use tokio::time::Instant;

/// What the owner should do after polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    last_received: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_received: now,
            ping_sent_at: None,
        }
    }

    /// Record inbound traffic.
    pub fn message_received(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_sent_at = None;
    }

    /// When `poll` next has something to do.
    pub fn next_deadline(&self) -> Instant {
        match self.ping_sent_at {
            Some(sent) => sent + self.timeout,
            None => self.last_received + self.interval,
        }
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        match self.ping_sent_at {
            Some(sent) if now >= sent + self.timeout => HeartbeatAction::TimedOut,
            Some(_) => HeartbeatAction::Idle,
            None if now >= self.last_received + self.interval => {
                self.ping_sent_at = Some(now);
                HeartbeatAction::SendPing
            }
            None => HeartbeatAction::Idle,
        }
    }

    pub fn awaiting_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }
}
