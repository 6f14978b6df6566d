//! Connection manager: owns the transport, its lifecycle state machine, the
//! heartbeat, the reconnect schedule and the outbound queue.
//!
//! Flow:
//!   1. `connect()` → CONNECTING, handshake through the [`Connector`]
//!   2. handshake ok → OPEN: retry state reset, heartbeat started, queue flushed
//!   3. error / abnormal close / missed pong → RECONNECTING, retry scheduled
//!   4. retry due → CONNECTING again; retries exhausted → CLOSED (terminal)
//!
//! A connection counts as healthy only once it has answered a ping. Failures
//! of connections that never did are counted across reconnects, so a server
//! that accepts but never pongs still exhausts `max_attempts`.
//!   5. `disconnect()` → CLOSED from anywhere, timers cancelled, queue kept
//!
//! All of this runs in one driver task; the [`ConnectionManager`] handle only
//! sends commands to it. Each event is handled to completion before the next
//! one is taken, so the state needs no locking.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use crate::config::LinkSettings;
use crate::dispatch::{Dispatcher, Subscription};
use crate::error::{LinkError, Result};
use crate::frame::{decode_frame, encode_frame, Frame, InboundEnvelope, PING, PONG};
use crate::heartbeat::{HeartbeatEvent, HeartbeatMonitor};
use crate::queue::{OutboundQueue, QueuedMessage};
use crate::reconnect::{ReconnectScheduler, RetryState};

use super::state::{ConnectionState, LinkStatus};
use super::transport::{Connector, Transport, TransportEvent};

/// WebSocket close code for a deliberate, normal closure.
const NORMAL_CLOSURE: u16 = 1000;

type DropListener = Arc<dyn Fn(&QueuedMessage) + Send + Sync>;
type DropListeners = Arc<Mutex<Vec<DropListener>>>;

/// A frame plus the id used to correlate acknowledgements and queue drops.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id:    String,
    pub frame: Frame,
}

impl OutboundMessage {
    pub fn new(id: impl Into<String>, frame: Frame) -> Self {
        OutboundMessage { id: id.into(), frame }
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send { id: String, payload: String },
    SendIfOpen { payload: String },
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Handle to a running connection driver. Dropping it stops the driver and
/// with it every timer and socket the driver owns.
pub struct ConnectionManager {
    cmd_tx:         mpsc::UnboundedSender<Command>,
    status_rx:      watch::Receiver<LinkStatus>,
    dispatcher:     Dispatcher,
    drop_listeners: DropListeners,
    task:           JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the driver on the current tokio runtime. The link starts CLOSED.
    pub fn spawn<C: Connector>(connector: C, settings: LinkSettings) -> Self {
        let scheduler = ReconnectScheduler::new(&settings);
        Self::spawn_with_scheduler(connector, settings, scheduler)
    }

    pub fn spawn_with_scheduler<C: Connector>(
        connector: C,
        settings:  LinkSettings,
        scheduler: ReconnectScheduler,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let dispatcher = Dispatcher::new();
        let drop_listeners: DropListeners = Arc::default();

        let driver = Driver::new(
            Box::new(connector),
            settings,
            scheduler,
            cmd_rx,
            status_tx,
            dispatcher.clone(),
            Arc::clone(&drop_listeners),
        );
        let task = tokio::spawn(driver.run());

        ConnectionManager { cmd_tx, status_rx, dispatcher, drop_listeners, task }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| LinkError::Closed)
    }

    /// Open the link if it is CLOSED (including after terminal failure).
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Close deliberately; no automatic reconnect follows.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Transmit now if OPEN, otherwise queue until the link opens.
    pub fn send(&self, msg: OutboundMessage) -> Result<()> {
        let payload = encode_frame(&msg.frame)?;
        self.command(Command::Send { id: msg.id, payload })
    }

    /// Transmit only if the link is OPEN when the driver gets to it; dropped
    /// otherwise and never queued or resent.
    pub fn send_if_open(&self, frame: &Frame) -> Result<()> {
        let payload = encode_frame(frame)?;
        self.command(Command::SendIfOpen { payload })
    }

    pub fn on_message<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(kind, handler)
    }

    /// Catch-all for frame types without a dedicated handler.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register_fallback(handler)
    }

    /// Called with every message evicted from the full outbound queue.
    pub fn on_dropped<F>(&self, listener: F)
    where
        F: Fn(&QueuedMessage) + Send + Sync + 'static,
    {
        self.drop_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(listener));
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Event {
    Command(Option<Command>),
    Handshake(Result<Transport>),
    Transport(Option<TransportEvent>),
    HeartbeatDue,
    RetryDue,
}

struct Driver {
    connector:      Box<dyn Connector>,
    settings:       LinkSettings,
    cmd_rx:         mpsc::UnboundedReceiver<Command>,
    status_tx:      watch::Sender<LinkStatus>,
    dispatcher:     Dispatcher,
    drop_listeners: DropListeners,

    state:     ConnectionState,
    terminal:  bool,
    /// The current connection has answered a ping.
    proven:    bool,
    /// Consecutive failures of connections that never answered a ping.
    unproven:  u32,
    retry:     RetryState,
    scheduler: ReconnectScheduler,
    heartbeat: HeartbeatMonitor,
    queue:     OutboundQueue,
    transport: Option<Transport>,
    handshake: Option<BoxFuture<'static, Result<Transport>>>,
}

impl Driver {
    fn new(
        connector:      Box<dyn Connector>,
        settings:       LinkSettings,
        scheduler:      ReconnectScheduler,
        cmd_rx:         mpsc::UnboundedReceiver<Command>,
        status_tx:      watch::Sender<LinkStatus>,
        dispatcher:     Dispatcher,
        drop_listeners: DropListeners,
    ) -> Self {
        Driver {
            retry:     RetryState::new(settings.max_attempts),
            heartbeat: HeartbeatMonitor::new(settings.heartbeat_interval, settings.heartbeat_timeout),
            queue:     OutboundQueue::new(settings.queue_capacity),
            connector,
            settings,
            cmd_rx,
            status_tx,
            dispatcher,
            drop_listeners,
            state:     ConnectionState::Closed,
            terminal:  false,
            proven:    false,
            unproven:  0,
            scheduler,
            transport: None,
            handshake: None,
        }
    }

    async fn run(mut self) {
        loop {
            match self.next_event().await {
                Event::Command(None) => break,
                Event::Command(Some(cmd)) => self.on_command(cmd),
                Event::Handshake(result) => self.on_handshake(result),
                Event::Transport(event) => self.on_transport(event),
                Event::HeartbeatDue => self.on_heartbeat_due(),
                Event::RetryDue => self.on_retry_due(),
            }
            self.publish();
        }
        debug!("link: all handles dropped, driver exiting");
        self.enter_closed();
    }

    async fn next_event(&mut self) -> Event {
        let heartbeat_at = self.heartbeat.deadline();
        let retry_at = self.scheduler.deadline();
        tokio::select! {
            biased;
            cmd = self.cmd_rx.recv() => Event::Command(cmd),
            res = poll_handshake(&mut self.handshake) => Event::Handshake(res),
            ev = recv_transport(&mut self.transport) => Event::Transport(ev),
            _ = sleep_until_opt(heartbeat_at) => Event::HeartbeatDue,
            _ = sleep_until_opt(retry_at) => Event::RetryDue,
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => match self.state {
                ConnectionState::Closed => {
                    info!("link: connecting");
                    self.terminal = false;
                    self.unproven = 0;
                    self.retry.reset();
                    self.begin_handshake();
                }
                state => debug!("link: connect ignored while {state}"),
            },
            Command::Disconnect => {
                if self.state != ConnectionState::Closed {
                    info!("link: disconnect requested while {}", self.state);
                }
                self.enter_closed();
            }
            Command::Send { id, payload } => {
                let msg = QueuedMessage { id, payload, enqueued_at: Instant::now() };
                if self.state == ConnectionState::Open {
                    self.transmit(msg);
                } else {
                    debug!("link: {} queued while {}", msg.id, self.state);
                    self.enqueue(msg);
                }
            }
            Command::SendIfOpen { payload } => match &self.transport {
                Some(t) if self.state == ConnectionState::Open => {
                    let _ = t.send_control(payload);
                }
                _ => debug!("link: transient frame dropped while {}", self.state),
            },
        }
    }

    fn begin_handshake(&mut self) {
        if !self.transition(ConnectionState::Connecting) {
            return;
        }
        let attempt = self.connector.connect();
        let limit = self.settings.handshake_timeout;
        self.handshake = Some(Box::pin(async move {
            match timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Handshake(format!("no handshake within {limit:?}"))),
            }
        }));
    }

    fn on_handshake(&mut self, result: Result<Transport>) {
        self.handshake = None;
        if self.state != ConnectionState::Connecting {
            return;
        }
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.transition(ConnectionState::Open);
                info!("link: open");
                self.proven = false;
                self.retry.reset();
                self.scheduler.cancel();
                self.heartbeat.start(Instant::now());
                self.flush();
            }
            Err(e) => self.on_link_failure(&format!("handshake failed: {e}")),
        }
    }

    /// Send everything queued while the link was down, oldest first. If the
    /// transport stops taking work part way, the rest goes back to the head of
    /// the queue; the transport's final event settles the link.
    fn flush(&mut self) {
        let pending = self.queue.drain_all();
        if pending.is_empty() {
            return;
        }
        debug!("link: flushing {} queued message(s)", pending.len());
        let mut unsent = Vec::new();
        let mut iter = pending.into_iter();
        for msg in iter.by_ref() {
            if !self.hand_over(&msg) {
                unsent.push(msg);
                break;
            }
        }
        unsent.extend(iter);
        if !unsent.is_empty() {
            debug!("link: transport closing, {} message(s) back in the queue", unsent.len());
            let overflow = self.queue.requeue_front(unsent);
            self.notify_dropped(overflow);
        }
    }

    fn transmit(&mut self, msg: QueuedMessage) {
        if self.hand_over(&msg) {
            debug!("link: sent {}", msg.id);
        } else {
            debug!("link: transport closing, {} queued", msg.id);
            self.enqueue(msg);
        }
    }

    fn hand_over(&self, msg: &QueuedMessage) -> bool {
        self.transport.as_ref().map_or(false, |t| t.send(msg.clone()).is_ok())
    }

    fn send_control(&self, frame: &Frame) -> bool {
        let Some(transport) = &self.transport else { return false };
        match encode_frame(frame) {
            Ok(payload) => transport.send_control(payload).is_ok(),
            Err(e) => {
                warn!("link: cannot encode {}: {e}", frame.kind);
                false
            }
        }
    }

    fn enqueue(&mut self, msg: QueuedMessage) {
        if let Some(evicted) = self.queue.enqueue(msg) {
            self.notify_dropped(vec![evicted]);
        }
    }

    fn notify_dropped(&self, dropped: Vec<QueuedMessage>) {
        if dropped.is_empty() {
            return;
        }
        let listeners: Vec<DropListener> = self
            .drop_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for msg in &dropped {
            warn!("link: outbound queue full, dropped message {}", msg.id);
            for listener in &listeners {
                listener(msg);
            }
        }
    }

    fn on_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(raw)) => self.on_frame(&raw),
            Some(TransportEvent::Unsent(msgs)) => {
                warn!("link: {} message(s) never reached the socket, requeued", msgs.len());
                let overflow = self.queue.requeue_front(msgs);
                self.notify_dropped(overflow);
            }
            Some(TransportEvent::Closed { code: Some(NORMAL_CLOSURE), reason }) => {
                info!("link: server closed the connection ({reason})");
                self.enter_closed();
            }
            Some(TransportEvent::Closed { code, reason }) => {
                self.on_link_failure(&format!("closed abnormally (code {code:?}) {reason}"));
            }
            Some(TransportEvent::Error(e)) => self.on_link_failure(&format!("transport error: {e}")),
            None => self.on_link_failure("transport ended"),
        }
    }

    fn on_frame(&mut self, raw: &str) {
        let frame = match decode_frame(raw) {
            Ok(f) => f,
            Err(e) => {
                warn!("link: bad frame: {e}");
                return;
            }
        };
        match frame.kind.as_str() {
            PING => {
                self.send_control(&Frame::pong());
            }
            PONG => {
                self.heartbeat.on_pong(Instant::now());
                self.proven = true;
                self.unproven = 0;
            }
            _ => {
                self.dispatcher.dispatch_envelope(&frame);
            }
        }
    }

    fn on_heartbeat_due(&mut self) {
        let now = Instant::now();
        match self.heartbeat.poll(now) {
            Some(HeartbeatEvent::SendPing) => {
                // A closing transport ends with its own event; until then the
                // ping just goes unanswered.
                if !self.send_control(&Frame::ping()) {
                    debug!("link: ping not handed over");
                }
                self.heartbeat.ping_sent(now);
            }
            Some(HeartbeatEvent::Expired) => {
                warn!("link: no pong within {:?}", self.settings.heartbeat_timeout);
                self.on_link_failure("heartbeat timeout");
            }
            None => {}
        }
    }

    fn on_retry_due(&mut self) {
        if !self.scheduler.fire(Instant::now()) || self.state != ConnectionState::Reconnecting {
            return;
        }
        info!("link: reconnect attempt {}/{}", self.retry.attempt, self.retry.max_attempts);
        self.begin_handshake();
    }

    /// Transient failure: tear down the transport and schedule a retry, or go
    /// terminal once retries, or connections that never answered a ping, reach
    /// `max_attempts`.
    fn on_link_failure(&mut self, reason: &str) {
        self.heartbeat.stop();
        self.transport = None;
        self.handshake = None;
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!("link: ignoring failure while {}: {reason}", self.state);
            return;
        }
        if self.state == ConnectionState::Open && !self.proven {
            self.unproven += 1;
        }
        let next = if self.unproven >= self.retry.max_attempts {
            None
        } else {
            self.scheduler.schedule_next(&mut self.retry, Instant::now())
        };
        match next {
            Some(delay) => {
                warn!(
                    "link: lost ({reason}); retry {}/{} in {delay:?}",
                    self.retry.attempt, self.retry.max_attempts,
                );
                self.transition(ConnectionState::Reconnecting);
            }
            None => {
                error!(
                    "link: lost ({reason}); giving up after {} attempts",
                    self.retry.max_attempts,
                );
                self.scheduler.cancel();
                self.terminal = true;
                self.transition(ConnectionState::Closed);
            }
        }
    }

    /// Deliberate close: timers, handshake and transport go in the same step
    /// as the state change. The queue is kept for a later connect.
    fn enter_closed(&mut self) {
        self.scheduler.cancel();
        self.heartbeat.stop();
        self.handshake = None;
        self.transport = None;
        self.retry.reset();
        self.unproven = 0;
        self.terminal = false;
        self.transition(ConnectionState::Closed);
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("link: illegal transition {} -> {next}", self.state);
            return false;
        }
        if self.state != next {
            debug!("link: {} -> {next}", self.state);
        }
        self.state = next;
        true
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            state:    self.state,
            attempt:  self.retry.attempt,
            queued:   self.queue.size(),
            terminal: self.terminal,
        }
    }

    fn publish(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn poll_handshake(handshake: &mut Option<BoxFuture<'static, Result<Transport>>>) -> Result<Transport> {
    match handshake {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_transport(transport: &mut Option<Transport>) -> Option<TransportEvent> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
