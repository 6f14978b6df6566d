//! One-way live-update channel (game and hint events).
//!
//! Runs its own [`ConnectionManager`], so drops, heartbeats and retries behave
//! exactly like the chat link. Nothing but heartbeats is ever sent on it.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::LinkSettings;
use crate::error::Result;
use crate::frame::Frame;
use crate::link::{ConnectionManager, Connector, LinkStatus};

pub const GAME_STARTED:   &str = "game_started";
pub const GAME_COMPLETED: &str = "game_completed";
pub const HINT_USED:      &str = "hint_used";

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum LiveEvent {
    GameStarted {
        game_id: String,
    },
    GameCompleted {
        game_id: String,
        #[serde(default)]
        team_id: Option<String>,
    },
    HintUsed {
        game_id: String,
        team_id: String,
        #[serde(default)]
        hint_id: Option<String>,
    },
}

impl LiveEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::to_value(frame)?)?)
    }
}

pub struct LiveUpdates {
    link:   ConnectionManager,
    events: broadcast::Sender<LiveEvent>,
}

impl LiveUpdates {
    pub fn spawn<C: Connector>(connector: C, settings: LinkSettings) -> Self {
        let link = ConnectionManager::spawn(connector, settings);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        for kind in [GAME_STARTED, GAME_COMPLETED, HINT_USED] {
            let tx = events.clone();
            link.on_message(kind, move |frame| {
                let event = LiveEvent::from_frame(frame)?;
                debug!("live: {event:?}");
                // No subscribers is fine; the event is simply not wanted.
                let _ = tx.send(event);
                Ok(())
            });
        }
        link.on_any(|frame| {
            debug!("live: ignoring {:?}", frame.kind);
            Ok(())
        });

        LiveUpdates { link, events }
    }

    pub fn connect(&self) -> Result<()> {
        info!("live: connecting");
        self.link.connect()
    }

    pub fn disconnect(&self) -> Result<()> { self.link.disconnect() }

    pub fn status(&self) -> LinkStatus { self.link.status() }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }
}
