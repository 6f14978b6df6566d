//! Connection lifecycle states and the status published to observers.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

impl ConnectionState {
    /// Legal edges of the lifecycle. `Closed → Open` is never legal: every
    /// open goes through `Connecting`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Closed, Connecting)
                | (Connecting, Open)
                | (Connecting, Reconnecting)
                | (Open, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed       => "CLOSED",
            ConnectionState::Connecting   => "CONNECTING",
            ConnectionState::Open         => "OPEN",
            ConnectionState::Reconnecting => "RECONNECTING",
        })
    }
}

/// What the UI sees of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state:   ConnectionState,
    /// Retries used in the current outage.
    pub attempt: u32,
    /// Messages waiting for the link to open.
    pub queued:  usize,
    /// Automatic retries are exhausted; only an explicit connect helps.
    pub terminal: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus { state: ConnectionState::Closed, attempt: 0, queued: 0, terminal: false }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{self, *};

    const ALL: [ConnectionState; 4] = [Closed, Connecting, Open, Reconnecting];

    #[test]
    fn closed_never_jumps_to_open() {
        assert!(!Closed.can_transition_to(Open));
        assert!(!Reconnecting.can_transition_to(Open));
    }

    #[test]
    fn every_state_can_close() {
        assert!(ALL.iter().all(|s| s.can_transition_to(Closed)));
    }

    #[test]
    fn open_is_only_reached_from_connecting() {
        let sources: Vec<_> = ALL.iter().filter(|s| s.can_transition_to(Open)).collect();
        assert_eq!(sources, vec![&Connecting]);
    }
}
