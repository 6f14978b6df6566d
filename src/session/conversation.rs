//! Chat modes, conversations and the messages they hold.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Ai,
    Admin,
    Team,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Ai    => "ai",
            ChatMode::Admin => "admin",
            ChatMode::Team  => "team",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ai"    => Ok(ChatMode::Ai),
            "admin" => Ok(ChatMode::Admin),
            "team"  => Ok(ChatMode::Team),
            other   => Err(LinkError::Config(format!("unknown chat mode {other:?}"))),
        }
    }
}

/// Identifies one conversation. AI and admin chats have no peer; in team mode
/// `peer = None` is the team-wide channel and `Some(id)` a direct chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub mode: ChatMode,
    pub peer: Option<String>,
}

impl ConversationKey {
    pub fn new(mode: ChatMode, peer: Option<String>) -> Self {
        let peer = if mode == ChatMode::Team { peer } else { None };
        ConversationKey { mode, peer }
    }

    pub fn global(mode: ChatMode) -> Self {
        ConversationKey { mode, peer: None }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer {
            Some(p) => write!(f, "{}/{p}", self.mode),
            None    => write!(f, "{}", self.mode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    /// Generated locally, e.g. the mode switch notice.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id:        String,
    pub sender_id: String,
    pub body:      String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub delivery:  DeliveryState,
}

impl ChatMessage {
    pub fn outgoing(id: impl Into<String>, sender_id: impl Into<String>, body: impl Into<String>) -> Self {
        ChatMessage {
            id:        id.into(),
            sender_id: sender_id.into(),
            body:      body.into(),
            timestamp: Utc::now(),
            direction: Direction::Outgoing,
            delivery:  DeliveryState::Pending,
        }
    }

    pub fn incoming(
        id:        impl Into<String>,
        sender_id: impl Into<String>,
        body:      impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        ChatMessage {
            id:        id.into(),
            sender_id: sender_id.into(),
            body:      body.into(),
            timestamp,
            direction: Direction::Incoming,
            delivery:  DeliveryState::Sent,
        }
    }

    pub fn system(body: impl Into<String>) -> Self {
        ChatMessage {
            id:        uuid::Uuid::new_v4().to_string(),
            sender_id: "system".into(),
            body:      body.into(),
            timestamp: Utc::now(),
            direction: Direction::System,
            delivery:  DeliveryState::Sent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub peer_id:      Option<String>,
    pub messages:     Vec<ChatMessage>,
    pub unread_count: u32,
    /// History has been fetched for this conversation.
    pub history_loaded: bool,
    /// A history fetch is under way.
    pub history_loading: bool,
}

impl Conversation {
    pub fn new(peer_id: Option<String>) -> Self {
        Conversation { peer_id, ..Default::default() }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Merge fetched history in front of what arrived live, skipping ids
    /// already present.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) {
        let mut merged: Vec<ChatMessage> = history
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect();
        merged.sort_by_key(|m| m.timestamp);
        merged.append(&mut self.messages);
        self.messages = merged;
        self.history_loaded = true;
        self.history_loading = false;
    }
}
