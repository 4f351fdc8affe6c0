//! Event bus - in-process pub/sub for lifecycle events
//!
//! Two delivery paths: a broadcast channel for passive subscribers (stats
//! displays, tests) and registered listeners fed by a single dispatcher
//! task, so listeners observe events in emission order and log files
//! preserve it. `emit` is fire-and-forget; `emit_sync` waits until every
//! event emitted so far - including this one - has been delivered, which
//! is what terminal task notifications need before the process exits.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::types::Event;

/// Default broadcast capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Async listener invoked per event; errors are logged, never propagated
pub type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

enum Dispatch {
    Fire(Event),
    /// Resolve once everything enqueued before it has been delivered
    Flush(oneshot::Sender<()>),
}

/// Central event bus
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    listeners: Arc<RwLock<Vec<(String, Listener)>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let listeners: Arc<RwLock<Vec<(String, Listener)>>> = Arc::new(RwLock::new(Vec::new()));

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Dispatch>();
        let dispatcher_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some(message) = dispatch_rx.recv().await {
                match message {
                    Dispatch::Fire(event) => {
                        let listeners = dispatcher_listeners.read().await.clone();
                        for (name, listener) in listeners {
                            if let Err(e) = listener(event.clone()).await {
                                warn!(listener = %name, error = %e, "event listener failed");
                            }
                        }
                    }
                    Dispatch::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            tx,
            dispatch_tx,
            listeners,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Register a named listener; delivery order follows registration order
    pub async fn on(&self, name: impl Into<String>, listener: Listener) {
        let name = name.into();
        debug!(%name, "EventBus::on: registering listener");
        self.listeners.write().await.push((name, listener));
    }

    /// Subscribe to the broadcast stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget emission; listeners still see events in order
    pub fn emit(&self, event: Event) {
        debug!(event_type = event.event_type(), task_id = event.task_id(), "EventBus::emit");
        let _ = self.tx.send(event.clone());
        let _ = self.dispatch_tx.send(Dispatch::Fire(event));
    }

    /// Awaited emission: returns once every listener has processed this
    /// event (and everything emitted before it). A failing listener is
    /// logged and does not break the chain.
    pub async fn emit_sync(&self, event: Event) {
        debug!(
            event_type = event.event_type(),
            task_id = event.task_id(),
            "EventBus::emit_sync"
        );
        let _ = self.tx.send(event.clone());
        let _ = self.dispatch_tx.send(Dispatch::Fire(event));

        let (done_tx, done_rx) = oneshot::channel();
        if self.dispatch_tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Create a bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
