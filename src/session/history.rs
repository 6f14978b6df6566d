//! Chat history collaborator.

use std::future::Future;

use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::auth::Credentials;
use crate::error::Result;

use super::conversation::{ChatMessage, ChatMode, DeliveryState, Direction};

/// Source of prior messages for a conversation, oldest first.
pub trait ChatHistory: Send + Sync + 'static {
    fn fetch(&self, mode: ChatMode, peer: Option<&str>)
        -> impl Future<Output = Result<Vec<ChatMessage>>> + Send;
}

/// For sessions without a history endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

impl ChatHistory for NoHistory {
    async fn fetch(&self, _mode: ChatMode, _peer: Option<&str>) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    id:        String,
    sender_id: String,
    body:      String,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
    #[serde(default)]
    outgoing:  bool,
}

impl From<HistoryEntry> for ChatMessage {
    fn from(e: HistoryEntry) -> Self {
        ChatMessage {
            id:        e.id,
            sender_id: e.sender_id,
            body:      e.body,
            timestamp: DateTime::<Utc>::from_timestamp_millis(e.timestamp).unwrap_or_default(),
            direction: if e.outgoing { Direction::Outgoing } else { Direction::Incoming },
            delivery:  DeliveryState::Sent,
        }
    }
}

/// `GET {base}/api/chat/history?mode=<mode>[&peer=<id>]`.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    http:        Client,
    base:        Url,
    credentials: Credentials,
}

impl HttpHistory {
    pub fn new(base: &str, credentials: Credentials) -> Result<Self> {
        Ok(HttpHistory { http: Client::new(), base: Url::parse(base)?, credentials })
    }

    pub fn request_url(&self, mode: ChatMode, peer: Option<&str>) -> Result<Url> {
        let mut url = self.base.join("/api/chat/history")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("mode", mode.as_str());
            if let Some(p) = peer {
                query.append_pair("peer", p);
            }
        }
        Ok(url)
    }
}

impl ChatHistory for HttpHistory {
    async fn fetch(&self, mode: ChatMode, peer: Option<&str>) -> Result<Vec<ChatMessage>> {
        let url = self.request_url(mode, peer)?;
        debug!("history: GET {url}");
        let mut req = self.http.get(url);
        if let Some((name, value)) = self.credentials.header() {
            req = req.header(name, value);
        }
        let entries: Vec<HistoryEntry> = req.send().await?.error_for_status()?.json().await?;
        let mut messages: Vec<ChatMessage> = entries.into_iter().map(ChatMessage::from).collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }
}
