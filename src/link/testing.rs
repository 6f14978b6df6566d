//! In-memory connector for driving the link from tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::LinkSettings;
use crate::error::{LinkError, Result};
use crate::frame::{decode_frame, Frame, PING};

use super::transport::{Connector, Transport, TransportPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    /// Never completes; the handshake timeout has to fire.
    Stall,
}

#[derive(Debug)]
struct Script {
    queued:   VecDeque<Outcome>,
    fallback: Outcome,
    attempts: usize,
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    peers:  mpsc::UnboundedSender<TransportPeer>,
}

/// Test side of a [`MockConnector`].
#[derive(Debug)]
pub struct MockServer {
    script: Arc<Mutex<Script>>,
    peers:  mpsc::UnboundedReceiver<TransportPeer>,
}

impl MockConnector {
    pub fn new() -> (MockConnector, MockServer) {
        let script = Arc::new(Mutex::new(Script {
            queued:   VecDeque::new(),
            fallback: Outcome::Accept,
            attempts: 0,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockConnector { script: Arc::clone(&script), peers: tx },
            MockServer { script, peers: rx },
        )
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.attempts += 1;
            let fallback = script.fallback;
            script.queued.pop_front().unwrap_or(fallback)
        };
        match outcome {
            Outcome::Accept => {
                let (transport, peer) = Transport::pair();
                let _ = self.peers.send(peer);
                Box::pin(async move { Ok(transport) })
            }
            Outcome::Refuse => {
                Box::pin(async { Err(LinkError::Handshake("connection refused".into())) })
            }
            Outcome::Stall => Box::pin(std::future::pending()),
        }
    }
}

impl MockServer {
    /// Outcomes for the next attempts, in order.
    pub fn script(&self, outcomes: &[Outcome]) {
        self.script.lock().unwrap().queued.extend(outcomes.iter().copied());
    }

    /// Outcome once the script runs out.
    pub fn otherwise(&self, outcome: Outcome) {
        self.script.lock().unwrap().fallback = outcome;
    }

    pub fn attempts(&self) -> usize {
        self.script.lock().unwrap().attempts
    }

    /// Next accepted connection.
    pub async fn accept(&mut self) -> TransportPeer {
        self.peers.recv().await.expect("connector dropped")
    }
}

/// Next frame the client wrote, skipping heartbeat pings.
pub async fn next_frame(peer: &mut TransportPeer) -> Frame {
    loop {
        let raw = peer.next_raw().await.expect("client transport closed");
        let frame = decode_frame(&raw).expect("client wrote a malformed frame");
        if frame.kind != PING {
            return frame;
        }
    }
}

/// Fast settings with jitter disabled.
pub fn settings() -> LinkSettings {
    LinkSettings {
        base_delay:         Duration::from_millis(100),
        max_delay:          Duration::from_millis(1_000),
        jitter_factor:      0.0,
        max_attempts:       5,
        heartbeat_interval: Duration::from_secs(5),
        heartbeat_timeout:  Duration::from_secs(2),
        handshake_timeout:  Duration::from_secs(3),
        queue_capacity:     10,
    }
}
