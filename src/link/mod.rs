//! The resilient link: one logical connection that survives drops.

pub mod manager;
pub mod state;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ConnectionManager, OutboundMessage};
pub use state::{ConnectionState, LinkStatus};
pub use transport::{Connector, Outbound, Transport, TransportEvent, TransportPeer};
pub use websocket::WsConnector;
