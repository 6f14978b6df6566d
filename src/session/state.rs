//! Session state and its pure transitions.
//!
//! Nothing here touches the network or the clock: callers pass `now` in and
//! act on the return values (send a frame, fetch history, notify the UI).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::time::Instant;

use crate::error::{LinkError, Result};
use crate::frame::{IncomingChat, RateLimitBody};

use super::conversation::{ChatMessage, ChatMode, Conversation, ConversationKey, DeliveryState, Direction};

/// How long a typing indicator stays visible without a refresh.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

pub const TEAM_NOTICE: &str = "Switched to team chat. Messages are visible to your team.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub exceeded:       bool,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub mode:          ChatMode,
    /// Selected team peer; `None` is the team-wide channel.
    pub active_peer:   Option<String>,
    pub conversations: HashMap<ConversationKey, Conversation>,
    /// Our own id, learned from the `connected` frame.
    pub user_id:       Option<String>,
    pub rate_limit:    RateLimitStatus,
    rate_limit_until:  Option<Instant>,
    typing:            HashMap<String, Instant>,
}

impl SessionState {
    pub fn new() -> Self { Self::default() }

    pub fn active_key(&self) -> ConversationKey {
        ConversationKey::new(self.mode, self.active_peer.clone())
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.conversation(&self.active_key())
    }

    fn conversation_mut(&mut self, key: &ConversationKey) -> &mut Conversation {
        self.conversations
            .entry(key.clone())
            .or_insert_with(|| Conversation::new(key.peer.clone()))
    }

    pub fn needs_history(&self, key: &ConversationKey) -> bool {
        self.conversations
            .get(key)
            .map_or(true, |c| !c.history_loaded && !c.history_loading)
    }

    /// Mark `key` as loading and hand it back if nobody has fetched or is
    /// fetching its history yet.
    fn claim_history(&mut self, key: ConversationKey) -> Option<ConversationKey> {
        if !self.needs_history(&key) {
            return None;
        }
        self.conversation_mut(&key).history_loading = true;
        Some(key)
    }

    /// A fetch claimed by [`switch_mode`](Self::switch_mode) or
    /// [`select_peer`](Self::select_peer) failed; the next visit retries.
    pub fn history_failed(&mut self, key: &ConversationKey) {
        self.conversation_mut(key).history_loading = false;
    }

    /// Change mode. Returns the newly active conversation when its history
    /// still has to be fetched; the caller owns that fetch and reports back
    /// through [`merge_history`](Self::merge_history) or
    /// [`history_failed`](Self::history_failed).
    pub fn switch_mode(&mut self, mode: ChatMode) -> Option<ConversationKey> {
        let previous = self.mode;
        self.mode = mode;
        if mode != ChatMode::Team {
            self.active_peer = None;
        }
        let key = self.active_key();
        let conv = self.conversation_mut(&key);
        if mode == ChatMode::Team && previous != ChatMode::Team {
            conv.messages.push(ChatMessage::system(TEAM_NOTICE));
        }
        conv.unread_count = 0;
        self.claim_history(key)
    }

    /// Select a team peer (`None` for the team-wide channel). Same return as
    /// [`switch_mode`](Self::switch_mode).
    pub fn select_peer(&mut self, peer: Option<String>) -> Result<Option<ConversationKey>> {
        if self.mode != ChatMode::Team {
            return Err(LinkError::NotTeamMode);
        }
        self.active_peer = peer;
        let key = self.active_key();
        self.conversation_mut(&key).unread_count = 0;
        Ok(self.claim_history(key))
    }

    pub fn merge_history(&mut self, key: &ConversationKey, history: Vec<ChatMessage>) {
        self.conversation_mut(key).merge_history(history);
    }

    /// Fail fast while the server says we are over the limit. An elapsed
    /// `retry_after` clears the flag.
    pub fn check_rate_limit(&mut self, now: Instant) -> Result<()> {
        if !self.rate_limit.exceeded {
            return Ok(());
        }
        match self.rate_limit_until {
            Some(until) if now >= until => {
                self.clear_rate_limit();
                Ok(())
            }
            Some(until) => Err(LinkError::RateLimited { retry_after: Some(until - now) }),
            None => Err(LinkError::RateLimited { retry_after: None }),
        }
    }

    pub fn apply_rate_limit(&mut self, body: &RateLimitBody, now: Instant) {
        if !body.exceeded {
            self.clear_rate_limit();
            return;
        }
        self.rate_limit = RateLimitStatus { exceeded: true, retry_after_ms: body.retry_after_ms };
        self.rate_limit_until = body.retry_after_ms.map(|ms| now + Duration::from_millis(ms));
    }

    fn clear_rate_limit(&mut self) {
        self.rate_limit = RateLimitStatus::default();
        self.rate_limit_until = None;
    }

    /// Append a pending outgoing message.
    pub fn push_outgoing(&mut self, key: &ConversationKey, id: &str, body: &str) {
        let sender = self.user_id.clone().unwrap_or_default();
        self.conversation_mut(key)
            .messages
            .push(ChatMessage::outgoing(id, sender, body));
    }

    /// Route an inbound chat message. Returns false for duplicates.
    pub fn receive(&mut self, chat: IncomingChat, now: DateTime<Utc>) -> bool {
        let key = self.route(&chat);
        let active = self.active_key();
        let own = self.user_id.as_deref() == Some(chat.sender_id.as_str());
        let conv = self.conversation_mut(&key);

        if let Some(existing) = conv.find_mut(&chat.id) {
            // Our own message echoed back counts as delivered.
            if existing.direction == Direction::Outgoing && existing.delivery == DeliveryState::Pending {
                existing.delivery = DeliveryState::Sent;
                return true;
            }
            debug!("session: duplicate message {} ignored", chat.id);
            return false;
        }

        let timestamp = chat
            .timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now);
        let mut msg = ChatMessage::incoming(chat.id, chat.sender_id, chat.text, timestamp);
        if own {
            msg.direction = Direction::Outgoing;
        }
        conv.messages.push(msg);
        if key != active && !own {
            conv.unread_count += 1;
        }
        true
    }

    /// Team direct messages land in the other party's conversation; team
    /// broadcasts in the team-wide one.
    fn route(&self, chat: &IncomingChat) -> ConversationKey {
        let mode = chat
            .mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(self.mode);
        if mode != ChatMode::Team {
            return ConversationKey::global(mode);
        }
        let peer = chat.recipient_id.as_ref().map(|recipient| {
            if self.user_id.as_deref() == Some(chat.sender_id.as_str()) {
                recipient.clone()
            } else {
                chat.sender_id.clone()
            }
        });
        ConversationKey::new(ChatMode::Team, peer)
    }

    /// Update the delivery state of an outgoing message wherever it lives.
    pub fn mark_delivery(&mut self, id: &str, state: DeliveryState) -> bool {
        for conv in self.conversations.values_mut() {
            if let Some(msg) = conv.find_mut(id) {
                if msg.direction != Direction::Outgoing || msg.delivery == state {
                    return false;
                }
                // An ack that raced a drop notification must not resurrect it.
                if msg.delivery == DeliveryState::Failed && state == DeliveryState::Sent {
                    return false;
                }
                msg.delivery = state;
                return true;
            }
        }
        false
    }

    pub fn set_typing(&mut self, sender: &str, is_typing: bool, now: Instant) {
        self.typing.retain(|_, at| now.saturating_duration_since(*at) < TYPING_TTL);
        if is_typing {
            self.typing.insert(sender.to_string(), now);
        } else {
            self.typing.remove(sender);
        }
    }

    /// Senders with a typing indicator fresher than [`TYPING_TTL`], sorted.
    pub fn typing_peers(&self, now: Instant) -> Vec<String> {
        let mut peers: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) < TYPING_TTL)
            .map(|(sender, _)| sender.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str, sender: &str, mode: &str, recipient: Option<&str>) -> IncomingChat {
        IncomingChat {
            id:           id.into(),
            sender_id:    sender.into(),
            text:         format!("text {id}"),
            mode:         Some(mode.into()),
            recipient_id: recipient.map(Into::into),
            timestamp:    Some(1_700_000_000_000),
        }
    }

    fn team_state() -> SessionState {
        let mut s = SessionState { user_id: Some("me".into()), ..SessionState::new() };
        s.switch_mode(ChatMode::Team);
        s
    }

    #[test]
    fn entering_team_adds_one_notice() {
        let mut s = SessionState::new();
        assert_eq!(s.switch_mode(ChatMode::Team), Some(ConversationKey::global(ChatMode::Team)));
        s.switch_mode(ChatMode::Team);
        let notices = s
            .active_conversation()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.direction == Direction::System)
            .count();
        assert_eq!(notices, 1);

        s.switch_mode(ChatMode::Ai);
        assert!(s.active_conversation().unwrap().messages.is_empty());
    }

    #[test]
    fn history_is_requested_only_until_loaded() {
        let mut s = SessionState::new();
        let key = s.switch_mode(ChatMode::Admin).unwrap();
        s.merge_history(&key, Vec::new());
        s.switch_mode(ChatMode::Ai);
        assert_eq!(s.switch_mode(ChatMode::Admin), None);
    }

    #[test]
    fn history_fetch_is_claimed_once_until_it_fails() {
        let mut s = SessionState::new();
        let key = s.switch_mode(ChatMode::Admin).unwrap();
        s.switch_mode(ChatMode::Ai);
        assert_eq!(s.switch_mode(ChatMode::Admin), None, "fetch already under way");

        s.history_failed(&key);
        assert_eq!(s.switch_mode(ChatMode::Admin), Some(key.clone()));
        s.merge_history(&key, Vec::new());
        let conv = s.conversation(&key).unwrap();
        assert!(conv.history_loaded && !conv.history_loading);
    }

    #[test]
    fn select_peer_requires_team_mode() {
        let mut s = SessionState::new();
        assert!(matches!(s.select_peer(Some("u2".into())), Err(LinkError::NotTeamMode)));

        let mut s = team_state();
        let key = s.select_peer(Some("u2".into())).unwrap().unwrap();
        assert_eq!(key, ConversationKey::new(ChatMode::Team, Some("u2".into())));
        assert_eq!(s.active_key(), key);
    }

    #[test]
    fn team_messages_route_by_peer() {
        let mut s = team_state();
        let now = Utc::now();
        assert!(s.receive(chat("1", "u2", "team", Some("me")), now));
        assert!(s.receive(chat("2", "u3", "team", None), now));
        assert!(s.receive(chat("3", "me", "team", Some("u4")), now));

        let direct = |p: &str| ConversationKey::new(ChatMode::Team, Some(p.into()));
        assert_eq!(s.conversation(&direct("u2")).unwrap().messages.len(), 1);
        assert_eq!(s.conversation(&direct("u4")).unwrap().messages.len(), 1);
        let global = s.conversation(&ConversationKey::global(ChatMode::Team)).unwrap();
        assert!(global.messages.iter().any(|m| m.id == "2"));
    }

    #[test]
    fn duplicates_are_ignored_and_unread_counts_inactive_only() {
        let mut s = team_state();
        let now = Utc::now();
        assert!(s.receive(chat("1", "u2", "team", Some("me")), now));
        assert!(!s.receive(chat("1", "u2", "team", Some("me")), now));
        assert!(s.receive(chat("2", "u3", "team", None), now));

        let direct = ConversationKey::new(ChatMode::Team, Some("u2".into()));
        assert_eq!(s.conversation(&direct).unwrap().unread_count, 1);
        let global = ConversationKey::global(ChatMode::Team);
        assert_eq!(s.conversation(&global).unwrap().unread_count, 0);

        s.select_peer(Some("u2".into())).unwrap();
        assert_eq!(s.conversation(&direct).unwrap().unread_count, 0);
    }

    #[test]
    fn ack_and_failure_update_delivery() {
        let mut s = SessionState::new();
        let key = s.active_key();
        s.push_outgoing(&key, "a", "hello");
        s.push_outgoing(&key, "b", "world");
        assert!(s.mark_delivery("a", DeliveryState::Sent));
        assert!(s.mark_delivery("b", DeliveryState::Failed));
        assert!(!s.mark_delivery("b", DeliveryState::Sent));
        assert!(!s.mark_delivery("missing", DeliveryState::Sent));

        let states: Vec<_> = s.conversation(&key).unwrap().messages.iter().map(|m| m.delivery).collect();
        assert_eq!(states, vec![DeliveryState::Sent, DeliveryState::Failed]);
    }

    #[test]
    fn echo_of_own_message_marks_it_sent() {
        let mut s = SessionState { user_id: Some("me".into()), ..SessionState::new() };
        let key = s.active_key();
        s.push_outgoing(&key, "m1", "hi");
        assert!(s.receive(chat("m1", "me", "ai", None), Utc::now()));
        let conv = s.conversation(&key).unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].delivery, DeliveryState::Sent);
    }

    #[test]
    fn rate_limit_blocks_until_cleared_or_elapsed() {
        let t0 = Instant::now();
        let mut s = SessionState::new();
        s.apply_rate_limit(&RateLimitBody { exceeded: true, retry_after_ms: Some(1_500) }, t0);
        match s.check_rate_limit(t0 + Duration::from_millis(500)) {
            Err(LinkError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_millis(1_000)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(s.check_rate_limit(t0 + Duration::from_millis(1_500)).is_ok());
        assert!(!s.rate_limit.exceeded);

        s.apply_rate_limit(&RateLimitBody { exceeded: true, retry_after_ms: None }, t0);
        assert!(s.check_rate_limit(t0 + Duration::from_secs(3_600)).is_err());
        s.apply_rate_limit(&RateLimitBody { exceeded: false, retry_after_ms: None }, t0);
        assert!(s.check_rate_limit(t0).is_ok());
    }

    #[test]
    fn typing_indicators_expire() {
        let t0 = Instant::now();
        let mut s = SessionState::new();
        s.set_typing("u2", true, t0);
        s.set_typing("u3", true, t0 + Duration::from_secs(3));
        assert_eq!(s.typing_peers(t0 + Duration::from_secs(4)), vec!["u2", "u3"]);
        assert_eq!(s.typing_peers(t0 + Duration::from_secs(6)), vec!["u3"]);
        s.set_typing("u3", false, t0 + Duration::from_secs(6));
        assert!(s.typing_peers(t0 + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn expired_typing_entries_are_pruned() {
        let t0 = Instant::now();
        let mut s = SessionState::new();
        for sender in ["u1", "u2", "u3"] {
            s.set_typing(sender, true, t0);
        }
        s.set_typing("u4", true, t0 + Duration::from_secs(10));
        assert_eq!(s.typing.len(), 1);
        assert_eq!(s.typing_peers(t0 + Duration::from_secs(10)), vec!["u4"]);
    }
}
