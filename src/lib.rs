//! Real-time connection resilience for the event platform's chat and live
//! updates.
//!
//! A [`link::ConnectionManager`] keeps one logical connection alive across
//! drops (heartbeats, backoff with jitter, a bounded outbound queue) and hands
//! inbound frames to a [`dispatch::Dispatcher`]. A [`session::SessionContext`]
//! builds chat modes, conversations and delivery tracking on top of it.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod link;
pub mod live;
pub mod queue;
pub mod reconnect;
pub mod session;

pub use error::{LinkError, Result};
