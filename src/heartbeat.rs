//! Liveness probing for the chat transport.
//!
//! The monitor owns no timer itself: the connection driver asks for the next
//! [`deadline`](HeartbeatMonitor::deadline), sleeps until it, then calls
//! [`poll`](HeartbeatMonitor::poll). This keeps every heartbeat decision a
//! plain state transition that tests can drive with explicit instants.

use std::time::Duration;

use tokio::time::Instant;

/// Snapshot of the monitor's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatState {
    pub last_pong_at: Option<Instant>,
    pub pending_ping: bool,
    pub timeout:      Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Time to send a `ping` frame.
    SendPing,
    /// The outstanding ping was not answered within the timeout.
    Expired,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval:     Duration,
    timeout:      Duration,
    running:      bool,
    next_ping_at: Option<Instant>,
    /// When the outstanding ping was sent.
    pending_since: Option<Instant>,
    last_pong_at:  Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        HeartbeatMonitor {
            interval,
            timeout,
            running: false,
            next_ping_at: None,
            pending_since: None,
            last_pong_at: None,
        }
    }

    /// Begin probing; the first ping is due one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.pending_since = None;
        self.next_ping_at = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.pending_since = None;
        self.next_ping_at = None;
    }

    pub fn is_running(&self) -> bool { self.running }

    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong_at = Some(now);
        self.pending_since = None;
    }

    /// Record that a ping was actually written to the transport.
    pub fn ping_sent(&mut self, now: Instant) {
        self.pending_since = Some(now);
        self.next_ping_at = Some(now + self.interval);
    }

    /// Next instant at which [`poll`](Self::poll) has something to do.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        match self.pending_since {
            Some(sent) => Some(sent + self.timeout),
            None       => self.next_ping_at,
        }
    }

    /// Advance the monitor to `now`.
    ///
    /// `Expired` is reported once per missed pong; the monitor stops itself
    /// and stays silent until the next [`start`](Self::start).
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatEvent> {
        if !self.running {
            return None;
        }
        if let Some(sent) = self.pending_since {
            if now >= sent + self.timeout {
                self.stop();
                return Some(HeartbeatEvent::Expired);
            }
            return None;
        }
        match self.next_ping_at {
            Some(due) if now >= due => Some(HeartbeatEvent::SendPing),
            _ => None,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        HeartbeatState {
            last_pong_at: self.last_pong_at,
            pending_ping: self.pending_since.is_some(),
            timeout:      self.timeout,
        }
    }
}
