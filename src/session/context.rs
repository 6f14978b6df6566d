//! Session context: chat operations on top of one [`ConnectionManager`].

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::frame::{
    AckBody, ConnectedBody, ErrorBody, Frame, IncomingChat, OutgoingChat, RateLimitBody, TypingBody,
    ACK, CHAT_MESSAGE, CONNECTED, DISCONNECTED, ERROR, RATE_LIMIT, TYPING,
};
use crate::link::{ConnectionManager, LinkStatus, OutboundMessage};

use super::conversation::{ChatMode, ConversationKey, DeliveryState};
use super::history::ChatHistory;
use super::state::SessionState;

/// State shared with the dispatcher callbacks.
#[derive(Debug)]
struct Shared {
    state:    Mutex<SessionState>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Run a transition and notify observers when it reports a change.
    fn update(&self, f: impl FnOnce(&mut SessionState) -> bool) {
        let changed = f(&mut self.lock());
        if changed {
            self.bump();
        }
    }
}

pub struct SessionContext<H: ChatHistory> {
    link:    ConnectionManager,
    history: H,
    shared:  Arc<Shared>,
}

impl<H: ChatHistory> SessionContext<H> {
    /// Wrap `link`, registering the session's frame handlers on it.
    pub fn new(link: ConnectionManager, history: H) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared { state: Mutex::new(SessionState::new()), revision });
        register_handlers(&link, &shared);
        SessionContext { link, history, shared }
    }

    pub fn link(&self) -> &ConnectionManager { &self.link }

    pub fn connect(&self) -> Result<()> { self.link.connect() }

    pub fn disconnect(&self) -> Result<()> { self.link.disconnect() }

    pub fn status(&self) -> LinkStatus { self.link.status() }

    /// Send to the active conversation, or to `mode`'s main conversation when
    /// a different mode is given. Returns the message id, or `None` for an
    /// empty body.
    pub fn send_message(&self, body: &str, mode: Option<ChatMode>) -> Result<Option<String>> {
        let key = {
            let state = self.shared.lock();
            match mode {
                Some(m) if m != state.mode => ConversationKey::global(m),
                _ => state.active_key(),
            }
        };
        self.send_to(key, body)
    }

    /// Send to the team-wide channel regardless of the selected peer.
    pub fn send_broadcast(&self, body: &str) -> Result<Option<String>> {
        self.send_to(ConversationKey::global(ChatMode::Team), body)
    }

    fn send_to(&self, key: ConversationKey, body: &str) -> Result<Option<String>> {
        let text = body.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.shared.lock();
            state.check_rate_limit(Instant::now())?;
            state.push_outgoing(&key, &id, text);
        }
        self.shared.bump();

        let frame = Frame::with_body(CHAT_MESSAGE, &OutgoingChat {
            id:      id.clone(),
            text:    text.to_string(),
            mode:    key.mode.as_str().to_string(),
            peer_id: key.peer.clone(),
        })?;
        if let Err(e) = self.link.send(OutboundMessage::new(id.clone(), frame)) {
            self.shared.update(|s| s.mark_delivery(&id, DeliveryState::Failed));
            return Err(e);
        }
        debug!("session: {id} -> {key}");
        Ok(Some(id))
    }

    /// Change the chat mode. The link is left alone; a first visit loads
    /// history for the newly active conversation.
    pub async fn switch_mode(&self, mode: ChatMode) {
        let fetch = self.shared.lock().switch_mode(mode);
        self.shared.bump();
        info!("session: mode {mode}");
        if let Some(key) = fetch {
            self.load_history(key).await;
        }
    }

    /// Select a team peer, or the team-wide channel with `None`.
    pub async fn select_peer(&self, peer: Option<&str>) -> Result<()> {
        let fetch = self.shared.lock().select_peer(peer.map(str::to_string))?;
        self.shared.bump();
        if let Some(key) = fetch {
            self.load_history(key).await;
        }
        Ok(())
    }

    async fn load_history(&self, key: ConversationKey) {
        match self.history.fetch(key.mode, key.peer.as_deref()).await {
            Ok(messages) => {
                debug!("session: {} history message(s) for {key}", messages.len());
                self.shared.lock().merge_history(&key, messages);
                self.shared.bump();
            }
            Err(e) => {
                warn!("session: history for {key} unavailable: {e}");
                self.shared.lock().history_failed(&key);
            }
        }
    }

    /// Typing indicator for the active conversation. Only sent while the link
    /// is open and we are not rate limited; never queued.
    pub fn send_typing(&self, is_typing: bool) -> Result<()> {
        let key = {
            let mut state = self.shared.lock();
            if state.check_rate_limit(Instant::now()).is_err() {
                return Ok(());
            }
            state.active_key()
        };
        let frame = Frame::with_body(TYPING, &TypingBody {
            sender_id: None,
            mode:      Some(key.mode.as_str().to_string()),
            peer_id:   key.peer,
            is_typing,
        })?;
        self.link.send_if_open(&frame)
    }

    pub fn typing_peers(&self) -> Vec<String> {
        self.shared.lock().typing_peers(Instant::now())
    }

    pub fn snapshot(&self) -> SessionState {
        self.shared.lock().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.shared.lock())
    }

    /// Revision counter bumped on every state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

fn register_handlers(link: &ConnectionManager, shared: &Arc<Shared>) {
    let s = Arc::clone(shared);
    link.on_message(CONNECTED, move |env| {
        let body: ConnectedBody = env.body_as()?;
        info!("session: connected as {:?}", body.user_id);
        if let Some(id) = body.user_id {
            s.update(|st| {
                st.user_id = Some(id);
                true
            });
        }
        Ok(())
    });

    link.on_message(DISCONNECTED, |_| {
        info!("session: server announced disconnect");
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_message(CHAT_MESSAGE, move |env| {
        let chat: IncomingChat = env.body_as()?;
        s.update(|st| st.receive(chat, Utc::now()));
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_message(ACK, move |env| {
        let ack: AckBody = env.body_as()?;
        s.update(|st| st.mark_delivery(&ack.id, DeliveryState::Sent));
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_message(ERROR, move |env| {
        let err: ErrorBody = env.body_as()?;
        warn!("session: server error: {}", err.message);
        if let Some(id) = err.id {
            s.update(|st| st.mark_delivery(&id, DeliveryState::Failed));
        }
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_message(RATE_LIMIT, move |env| {
        let body: RateLimitBody = env.body_as()?;
        if body.exceeded {
            warn!("session: rate limited, retry after {:?} ms", body.retry_after_ms);
        }
        s.update(|st| {
            st.apply_rate_limit(&body, Instant::now());
            true
        });
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_message(TYPING, move |env| {
        let body: TypingBody = env.body_as()?;
        let Some(sender) = body.sender_id else { return Ok(()) };
        s.update(|st| {
            st.set_typing(&sender, body.is_typing, Instant::now());
            true
        });
        Ok(())
    });

    let s = Arc::clone(shared);
    link.on_dropped(move |msg| {
        s.update(|st| st.mark_delivery(&msg.id, DeliveryState::Failed));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::link::testing::{next_frame, settings, MockConnector, MockServer};
    use crate::link::ConnectionState;
    use crate::session::conversation::{ChatMessage, Direction};
    use crate::session::history::NoHistory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeHistory {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ChatHistory for Arc<FakeHistory> {
        async fn fetch(&self, mode: ChatMode, peer: Option<&str>) -> Result<Vec<ChatMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let id = format!("h-{mode}-{}", peer.unwrap_or("all"));
            Ok(vec![ChatMessage::incoming(id, "u9", "earlier", Utc::now())])
        }
    }

    fn session<H: ChatHistory>(history: H) -> (SessionContext<H>, MockServer) {
        let (connector, server) = MockConnector::new();
        (SessionContext::new(ConnectionManager::spawn(connector, settings()), history), server)
    }

    async fn until(mut f: impl FnMut() -> bool) {
        while !f() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn delivery(ctx: &SessionContext<impl ChatHistory>, id: &str) -> Option<DeliveryState> {
        ctx.with_state(|s| {
            s.conversations
                .values()
                .flat_map(|c| c.messages.iter())
                .find(|m| m.id == id)
                .map(|m| m.delivery)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn empty_body_is_a_no_op() {
        let (ctx, _server) = session(NoHistory);
        assert_eq!(ctx.send_message("   \n", None).unwrap(), None);
        assert!(ctx.snapshot().conversations.is_empty());
        assert_eq!(ctx.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_sent_while_closed_arrive_in_order() {
        let (ctx, mut server) = session(NoHistory);
        let a = ctx.send_message("a", None).unwrap().unwrap();
        ctx.send_message("b", None).unwrap();
        assert_eq!(delivery(&ctx, &a), Some(DeliveryState::Pending));

        ctx.connect().unwrap();
        let mut peer = server.accept().await;
        let first = next_frame(&mut peer).await;
        let second = next_frame(&mut peer).await;
        assert_eq!(first.body["text"], "a");
        assert_eq!(second.body["text"], "b");
        assert_eq!(first.body["mode"], "ai");

        peer.push_frame(format!(r#"{{"type":"ack","body":{{"id":"{a}"}}}}"#));
        until(|| delivery(&ctx, &a) == Some(DeliveryState::Sent)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejects_without_sending() {
        let (ctx, mut server) = session(NoHistory);
        ctx.connect().unwrap();
        let mut peer = server.accept().await;
        peer.push_frame(r#"{"type":"rate_limit","body":{"exceeded":true,"retry_after_ms":2000}}"#);
        until(|| ctx.with_state(|s| s.rate_limit.exceeded)).await;

        let before = ctx.snapshot().active_conversation().map_or(0, |c| c.messages.len());
        match ctx.send_message("spam", None) {
            Err(LinkError::RateLimited { retry_after }) => assert!(retry_after.is_some()),
            other => panic!("expected rate limit, got {other:?}"),
        }
        let after = ctx.snapshot().active_conversation().map_or(0, |c| c.messages.len());
        assert_eq!(before, after);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        ctx.send_message("later", None).unwrap();
        assert_eq!(next_frame(&mut peer).await.body["text"], "later");
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_and_queue_drop_mark_failed() {
        let (connector, mut server) = MockConnector::new();
        let cfg = crate::config::LinkSettings { queue_capacity: 1, ..settings() };
        let ctx = SessionContext::new(ConnectionManager::spawn(connector, cfg), NoHistory);

        let dropped = ctx.send_message("first", None).unwrap().unwrap();
        let kept = ctx.send_message("second", None).unwrap().unwrap();
        until(|| delivery(&ctx, &dropped) == Some(DeliveryState::Failed)).await;

        ctx.connect().unwrap();
        let peer = server.accept().await;
        peer.push_frame(format!(
            r#"{{"type":"error","body":{{"id":"{kept}","message":"rejected"}}}}"#
        ));
        until(|| delivery(&ctx, &kept) == Some(DeliveryState::Failed)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn mode_switch_fetches_history_once_and_keeps_link() {
        let history = Arc::new(FakeHistory::default());
        let (ctx, mut server) = session(Arc::clone(&history));
        ctx.connect().unwrap();
        let _peer = server.accept().await;
        until(|| ctx.status().state == ConnectionState::Open).await;
        let mut changes = ctx.changes();

        ctx.switch_mode(ChatMode::Team).await;
        assert!(changes.has_changed().unwrap());
        ctx.switch_mode(ChatMode::Ai).await;
        ctx.switch_mode(ChatMode::Team).await;
        assert_eq!(history.calls.load(Ordering::SeqCst), 2, "team + ai, each once");

        let team = ctx.snapshot();
        let conv = team.active_conversation().unwrap();
        assert!(conv.messages.iter().any(|m| m.id == "h-team-all"));
        let notices = conv.messages.iter().filter(|m| m.direction == Direction::System).count();
        assert_eq!(notices, 2, "one notice per entry into team mode");

        assert_eq!(ctx.status().state, ConnectionState::Open);
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_visits_share_one_history_fetch() {
        let history = Arc::new(FakeHistory { delay: Duration::from_millis(50), ..Default::default() });
        let (ctx, _server) = session(Arc::clone(&history));
        ctx.switch_mode(ChatMode::Team).await;

        let (a, b) = tokio::join!(ctx.select_peer(Some("u2")), ctx.select_peer(Some("u2")));
        a.unwrap();
        b.unwrap();
        assert_eq!(history.calls.load(Ordering::SeqCst), 2, "team channel + u2, each once");

        let u2 = ConversationKey::new(ChatMode::Team, Some("u2".into()));
        let fetched = ctx.with_state(|s| {
            let conv = s.conversation(&u2).unwrap();
            assert!(conv.history_loaded);
            conv.messages.iter().filter(|m| m.id == "h-team-u2").count()
        });
        assert_eq!(fetched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_selection_routes_direct_messages() {
        let history = Arc::new(FakeHistory::default());
        let (ctx, mut server) = session(Arc::clone(&history));
        assert!(matches!(ctx.select_peer(Some("u2")).await, Err(LinkError::NotTeamMode)));

        ctx.switch_mode(ChatMode::Team).await;
        ctx.select_peer(Some("u2")).await.unwrap();
        ctx.connect().unwrap();
        let mut peer = server.accept().await;

        ctx.send_message("hi u2", None).unwrap();
        let out = next_frame(&mut peer).await;
        assert_eq!(out.body["peer_id"], "u2");
        assert_eq!(out.body["mode"], "team");

        ctx.send_broadcast("hi all").unwrap();
        let out = next_frame(&mut peer).await;
        assert!(out.body.get("peer_id").is_none());

        peer.push_frame(
            r#"{"type":"chat_message","body":{"id":"x1","sender_id":"u3","text":"psst","mode":"team","recipient_id":"me"}}"#,
        );
        let u3 = ConversationKey::new(ChatMode::Team, Some("u3".into()));
        until(|| ctx.with_state(|s| s.conversation(&u3).map_or(0, |c| c.unread_count) == 1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn typing_frames_only_go_out_while_open() {
        let (ctx, mut server) = session(NoHistory);
        ctx.send_typing(true).unwrap();
        ctx.send_message("hello", None).unwrap();
        until(|| ctx.status().queued == 1).await;

        ctx.connect().unwrap();
        let mut peer = server.accept().await;
        assert_eq!(next_frame(&mut peer).await.kind, CHAT_MESSAGE, "typing was not queued");
        until(|| ctx.status().state == ConnectionState::Open).await;
        ctx.send_typing(true).unwrap();
        let out = next_frame(&mut peer).await;
        assert_eq!(out.kind, TYPING);
        assert_eq!(out.body["is_typing"], true);

        peer.push_frame(r#"{"type":"typing","body":{"sender_id":"u5","is_typing":true}}"#);
        until(|| ctx.typing_peers() == vec!["u5"]).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(ctx.typing_peers().is_empty());
    }
}
