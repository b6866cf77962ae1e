//! Realtime session manager.
//!
//! `RealtimeSession` drives a supplied [`RealtimeTransport`] through its
//! lifecycle, keeps explicit reference counts for subscription keys, and fans
//! transport events out to registered callbacks. After the transport reports
//! a reconnect, every distinct subscription key is replayed server-side since
//! the server loses subscription state across reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::realtime::transport::{RealtimeTransport, TransportError, TransportEvent};

const SUBSCRIBE_METHOD: &str = "subscribe";
const UNSUBSCRIBE_METHOD: &str = "unsubscribe";

/// Connection lifecycle state as last reported by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Lifecycle event categories a handler can register for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleKind {
    Closed,
    Reconnecting,
    Reconnected,
}

/// Lifecycle event delivered to registered handlers.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// The connection closed for good.
    Closed {
        /// Transport-reported reason, when one exists.
        error: Option<String>,
    },
    /// The connection dropped and the transport is retrying.
    Reconnecting {
        /// Transport-reported reason, when one exists.
        error: Option<String>,
    },
    /// The connection came back.
    Reconnected {
        /// New connection identifier, when assigned.
        connection_id: Option<String>,
    },
}

impl LifecycleEvent {
    /// Category used to match registered handlers.
    pub fn kind(&self) -> LifecycleKind {
        match self {
            Self::Closed { .. } => LifecycleKind::Closed,
            Self::Reconnecting { .. } => LifecycleKind::Reconnecting,
            Self::Reconnected { .. } => LifecycleKind::Reconnected,
        }
    }
}

/// Callback invoked with the payload of each message on a subscribed key.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;
/// Callback invoked for lifecycle events of a registered kind.
pub type LifecycleCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Identifies one registered lifecycle handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandlerId(u64);

/// Handle for one successful `subscribe` call.
///
/// Each handle accounts for exactly one reference on its key; pass it back to
/// [`RealtimeSession::unsubscribe`] to release it.
#[derive(Clone, Debug)]
pub struct Subscription {
    id: u64,
    key: String,
}

impl Subscription {
    /// Composite subscription key this handle holds a reference on.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Builds the composite key for a scope and event name.
///
/// The scope is omitted when absent or empty, leaving the bare event name.
pub fn subscription_key(scope: Option<&str>, event: &str) -> String {
    match scope {
        Some(scope) if !scope.is_empty() => format!("{scope}:{event}"),
        _ => event.to_string(),
    }
}

#[derive(Default)]
struct SubscriptionTable {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, EventCallback)>>,
}

impl SubscriptionTable {
    fn add(&mut self, key: &str, callback: EventCallback) -> Subscription {
        self.next_id += 1;
        let id = self.next_id;
        self.by_key
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        Subscription {
            id,
            key: key.to_string(),
        }
    }

    /// Removes one entry; returns whether the key has no entries left.
    fn remove(&mut self, subscription: &Subscription) -> bool {
        let Some(entries) = self.by_key.get_mut(&subscription.key) else {
            return false;
        };
        entries.retain(|(id, _)| *id != subscription.id);
        if entries.is_empty() {
            self.by_key.remove(&subscription.key);
            true
        } else {
            false
        }
    }

    fn distinct_keys(&self) -> Vec<String> {
        self.by_key.keys().cloned().collect()
    }

    fn callbacks_for(&self, key: &str) -> Vec<EventCallback> {
        self.by_key
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct LifecycleRegistry {
    next_id: u64,
    handlers: Vec<(HandlerId, LifecycleKind, LifecycleCallback)>,
}

struct SessionShared {
    transport: Arc<dyn RealtimeTransport>,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<SubscriptionTable>,
    lifecycle: Mutex<LifecycleRegistry>,
    settled: watch::Sender<bool>,
}

impl SessionShared {
    fn notify_lifecycle(&self, event: &LifecycleEvent) {
        let callbacks: Vec<LifecycleCallback> = self
            .lifecycle
            .lock()
            .handlers
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind())
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }
}

/// Authenticated realtime session over a supplied transport.
pub struct RealtimeSession {
    shared: Arc<SessionShared>,
    dispatch: JoinHandle<()>,
}

impl RealtimeSession {
    /// Creates a session in `Connecting` state and spawns its dispatch task.
    ///
    /// `events` is the channel the transport reports lifecycle and message
    /// events on.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (settled, _) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            transport,
            state: Mutex::new(ConnectionState::Connecting),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            lifecycle: Mutex::new(LifecycleRegistry::default()),
            settled,
        });
        let dispatch = spawn_dispatch(Arc::clone(&shared), events);
        Self { shared, dispatch }
    }

    /// Starts the transport, retrying once with a forced token refresh.
    ///
    /// The refresh flag is threaded into the retry attempt's authentication
    /// only; it cannot leak into later refresh decisions. The initial attempt
    /// is marked settled whether it succeeded or failed, so subscribers are
    /// never left waiting behind a failed first connect.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let result = match self.shared.transport.start(false).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    event = "realtime_start_retry",
                    error = %err,
                    "initial start failed, retrying with forced token refresh"
                );
                self.shared.transport.start(true).await
            }
        };

        if result.is_ok() {
            *self.shared.state.lock() = ConnectionState::Connected;
        }
        // send_replace records the settle even when nobody subscribed yet.
        self.shared.settled.send_replace(true);
        result
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Distinct subscription keys currently held.
    pub fn subscribed_keys(&self) -> Vec<String> {
        self.shared.subscriptions.lock().distinct_keys()
    }

    /// Subscribes `callback` to messages on `scope:event`.
    ///
    /// Waits for the initial connection attempt to settle, then registers
    /// interest server-side. Subscriptions are best-effort: a failed
    /// server-side call is logged and `None` is returned.
    pub async fn subscribe(
        &self,
        scope: Option<&str>,
        event: &str,
        callback: EventCallback,
    ) -> Option<Subscription> {
        self.await_initial_attempt().await;
        let key = subscription_key(scope, event);

        match self.shared.transport.invoke(SUBSCRIBE_METHOD, &key).await {
            Ok(()) => Some(self.shared.subscriptions.lock().add(&key, callback)),
            Err(err) => {
                warn!(event = "subscribe_failed", key = %key, error = %err);
                None
            }
        }
    }

    /// Releases one reference on the subscription's key.
    ///
    /// The local callback is always deregistered; the server-side
    /// deregistration is issued only when the last reference for the key is
    /// released, and its failure is logged and swallowed.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        self.await_initial_attempt().await;

        let last_for_key = self.shared.subscriptions.lock().remove(&subscription);
        if !last_for_key {
            return;
        }

        if let Err(err) = self
            .shared
            .transport
            .invoke(UNSUBSCRIBE_METHOD, &subscription.key)
            .await
        {
            warn!(event = "unsubscribe_failed", key = %subscription.key, error = %err);
        }
    }

    /// Registers a handler for lifecycle events of `kind`.
    pub fn on_lifecycle(&self, kind: LifecycleKind, callback: LifecycleCallback) -> HandlerId {
        let mut registry = self.shared.lifecycle.lock();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry.handlers.push((id, kind, callback));
        id
    }

    /// Deregisters a previously registered lifecycle handler.
    pub fn off_lifecycle(&self, id: HandlerId) {
        self.shared
            .lifecycle
            .lock()
            .handlers
            .retain(|(handler_id, _, _)| *handler_id != id);
    }

    /// Tears the session down: stops the transport and ends dispatch.
    pub async fn destroy(self) {
        *self.shared.state.lock() = ConnectionState::Closed;
        self.shared.transport.stop().await;
        self.dispatch.abort();
    }

    async fn await_initial_attempt(&self) {
        let mut settled = self.shared.settled.subscribe();
        while !*settled.borrow_and_update() {
            if settled.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

fn spawn_dispatch(
    shared: Arc<SessionShared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Closed { error } => {
                    *shared.state.lock() = ConnectionState::Closed;
                    shared.notify_lifecycle(&LifecycleEvent::Closed { error });
                }
                TransportEvent::Reconnecting { error } => {
                    *shared.state.lock() = ConnectionState::Reconnecting;
                    shared.notify_lifecycle(&LifecycleEvent::Reconnecting { error });
                }
                TransportEvent::Reconnected { connection_id } => {
                    *shared.state.lock() = ConnectionState::Connected;
                    shared.notify_lifecycle(&LifecycleEvent::Reconnected { connection_id });
                    replay_subscriptions(&shared).await;
                }
                TransportEvent::Event { key, payload } => {
                    let callbacks = shared.subscriptions.lock().callbacks_for(&key);
                    for callback in callbacks {
                        callback(&payload);
                    }
                }
            }
        }
    })
}

/// Re-registers every distinct subscription key after a reconnect.
///
/// Replay is best-effort: a failed key is logged and never retried, and it
/// does not block replaying the remaining keys.
async fn replay_subscriptions(shared: &SessionShared) {
    let keys = shared.subscriptions.lock().distinct_keys();
    debug!(event = "resubscribe_replay", keys = keys.len());

    for key in keys {
        if let Err(err) = shared.transport.invoke(SUBSCRIBE_METHOD, &key).await {
            warn!(event = "resubscribe_failed", key = %key, error = %err);
        }
    }
}
