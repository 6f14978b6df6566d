//! Routes inbound frames to the callbacks registered for their type.
//!
//! Several independent subscribers may listen to the same type; they run in
//! registration order. A failing handler (error or panic) is logged and the
//! remaining handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, warn};

use crate::frame::{decode_frame, InboundEnvelope};

pub type Handler = dyn Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync;

type HandlerList = Vec<(u64, Arc<Handler>)>;

#[derive(Default)]
struct HandlerRegistry {
    next_id:  u64,
    by_type:  HashMap<String, HandlerList>,
    fallback: HandlerList,
}

impl HandlerRegistry {
    fn insert(&mut self, kind: Option<&str>, handler: Arc<Handler>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        match kind {
            Some(k) => self.by_type.entry(k.to_string()).or_default().push((id, handler)),
            None    => self.fallback.push((id, handler)),
        }
        id
    }

    fn remove(&mut self, kind: Option<&str>, id: u64) {
        let list = match kind {
            Some(k) => match self.by_type.get_mut(k) {
                Some(l) => l,
                None    => return,
            },
            None => &mut self.fallback,
        };
        list.retain(|(h, _)| *h != id);
        if let Some(k) = kind {
            if list.is_empty() {
                self.by_type.remove(k);
            }
        }
    }
}

fn lock(registry: &Mutex<HandlerRegistry>) -> MutexGuard<'_, HandlerRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by registration; call [`unsubscribe`](Self::unsubscribe)
/// to stop receiving frames. Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    id:       u64,
    kind:     Option<String>,
    registry: Weak<Mutex<HandlerRegistry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.kind.as_deref(), self.id);
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.len())
            .finish()
    }
}

/// Cheap to clone; clones share one registry.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<HandlerRegistry>>,
}

impl Dispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn register<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = lock(&self.registry).insert(Some(kind), Arc::new(handler));
        Subscription { id, kind: Some(kind.to_string()), registry: Arc::downgrade(&self.registry) }
    }

    /// Register a catch-all for frame types nobody else handles.
    pub fn register_fallback<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = lock(&self.registry).insert(None, Arc::new(handler));
        Subscription { id, kind: None, registry: Arc::downgrade(&self.registry) }
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        lock(&self.registry).by_type.get(kind).map_or(0, Vec::len)
    }

    /// Parse a raw text frame and dispatch it. Malformed frames are logged and
    /// dropped. Returns the number of handlers that ran.
    pub fn dispatch(&self, raw: &str) -> usize {
        match decode_frame(raw) {
            Ok(envelope) => self.dispatch_envelope(&envelope),
            Err(e) => {
                warn!("dispatch: malformed frame dropped: {e}");
                0
            }
        }
    }

    pub fn dispatch_envelope(&self, envelope: &InboundEnvelope) -> usize {
        // Snapshot under the lock, run without it: handlers may (un)register.
        let handlers: HandlerList = {
            let registry = lock(&self.registry);
            match registry.by_type.get(&envelope.kind) {
                Some(list) => list.clone(),
                None       => registry.fallback.clone(),
            }
        };
        if handlers.is_empty() {
            debug!("dispatch: no handler for frame type {:?}", envelope.kind);
            return 0;
        }
        for (_, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(()))  => {}
                Ok(Err(e))  => warn!("dispatch: {} handler failed: {e:#}", envelope.kind),
                Err(_)      => warn!("dispatch: {} handler panicked", envelope.kind),
            }
        }
        handlers.len()
    }
}
