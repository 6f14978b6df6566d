//! The seam between the connection driver and a concrete socket.
//!
//! A [`Connector`] performs the handshake and hands back a [`Transport`]: two
//! channels fed by whatever pump owns the real socket. The driver never sees
//! the socket itself, so anything that can fill the channels (WebSocket,
//! in-memory pair) can carry the link.
//!
//! A pump that stops with messages still in its channel reports them in one
//! [`TransportEvent::Unsent`] before its final event, so the driver can put
//! them back in the queue.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{LinkError, Result};
use crate::queue::QueuedMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame from the server.
    Frame(String),
    /// Messages handed over but never written; always precedes the final event.
    Unsent(Vec<QueuedMessage>),
    /// The server closed the socket.
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// One item on its way to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Heartbeats, typing and other frames that are stale by the next connect.
    Control(String),
    Message(QueuedMessage),
}

impl Outbound {
    pub fn payload(&self) -> &str {
        match self {
            Outbound::Control(text) => text,
            Outbound::Message(msg) => &msg.payload,
        }
    }

    pub fn into_payload(self) -> String {
        match self {
            Outbound::Control(text) => text,
            Outbound::Message(msg) => msg.payload,
        }
    }
}

/// Pull whatever is still buffered in a closed pump channel, keeping only
/// messages worth resending.
pub fn drain_unsent(outgoing: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<QueuedMessage> {
    outgoing.close();
    let mut unsent = Vec::new();
    while let Ok(item) = outgoing.try_recv() {
        if let Outbound::Message(msg) = item {
            unsent.push(msg);
        }
    }
    unsent
}

/// Client half of an established connection.
#[derive(Debug)]
pub struct Transport {
    outgoing: mpsc::UnboundedSender<Outbound>,
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Far end of an in-memory [`Transport`]. Dropping it behaves like a socket
/// that died: unread messages come back as [`TransportEvent::Unsent`].
#[derive(Debug)]
pub struct TransportPeer {
    /// Frames the client wrote.
    pub received: mpsc::UnboundedReceiver<Outbound>,
    /// Feed events to the client.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportPeer {
    pub fn push_frame(&self, raw: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Frame(raw.into())).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.events
            .send(TransportEvent::Closed { code: Some(code), reason: reason.into() })
            .is_ok()
    }

    /// Next frame the client wrote; `None` once the client dropped its half.
    pub async fn next_raw(&mut self) -> Option<String> {
        self.received.recv().await.map(Outbound::into_payload)
    }
}

impl Drop for TransportPeer {
    fn drop(&mut self) {
        let unsent = drain_unsent(&mut self.received);
        if !unsent.is_empty() {
            let _ = self.events.send(TransportEvent::Unsent(unsent));
        }
    }
}

impl Transport {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Outbound>,
        incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Transport { outgoing, incoming }
    }

    /// Connected in-memory pair.
    pub fn pair() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (Transport::new(out_tx, in_rx), TransportPeer { received: out_rx, events: in_tx })
    }

    /// Hand one queued message to the pump. Fails once the pump has stopped
    /// taking work; its final events are still to come on [`recv`](Self::recv).
    pub fn send(&self, msg: QueuedMessage) -> Result<()> {
        self.outgoing.send(Outbound::Message(msg)).map_err(|_| LinkError::Closed)
    }

    /// Hand over a frame that is not resent if the socket dies.
    pub fn send_control(&self, payload: String) -> Result<()> {
        self.outgoing.send(Outbound::Control(payload)).map_err(|_| LinkError::Closed)
    }

    /// Next event; `None` once the pump has gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }
}

/// Opens transports. Called once per connect or reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>>;
}

impl<C: Connector + ?Sized> Connector for std::sync::Arc<C> {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>> {
        (**self).connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn queued(id: &str) -> QueuedMessage {
        QueuedMessage { id: id.into(), payload: format!("payload-{id}"), enqueued_at: Instant::now() }
    }

    #[tokio::test]
    async fn pair_carries_frames_both_ways() {
        let (mut transport, mut peer) = Transport::pair();
        transport.send(queued("up")).unwrap();
        transport.send_control("beat".into()).unwrap();
        assert_eq!(peer.next_raw().await.as_deref(), Some("payload-up"));
        assert_eq!(peer.next_raw().await.as_deref(), Some("beat"));

        assert!(peer.push_frame("down"));
        assert_eq!(transport.recv().await, Some(TransportEvent::Frame("down".into())));
    }

    #[tokio::test]
    async fn send_fails_after_peer_drops() {
        let (mut transport, peer) = Transport::pair();
        drop(peer);
        assert!(transport.send(queued("lost")).is_err());
        assert_eq!(transport.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_peer_hands_back_unread_messages_only() {
        let (mut transport, mut peer) = Transport::pair();
        transport.send(queued("read")).unwrap();
        transport.send_control("beat".into()).unwrap();
        transport.send(queued("a")).unwrap();
        transport.send(queued("b")).unwrap();
        assert_eq!(peer.next_raw().await.as_deref(), Some("payload-read"));
        drop(peer);

        match transport.recv().await {
            Some(TransportEvent::Unsent(msgs)) => {
                let ids: Vec<_> = msgs.iter().map(|m| m.id.as_str()).collect();
                assert_eq!(ids, ["a", "b"]);
            }
            other => panic!("expected unsent messages, got {other:?}"),
        }
        assert_eq!(transport.recv().await, None);
    }
}
