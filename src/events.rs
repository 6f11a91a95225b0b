//! Session Events
//!
//! Fan-out of lifecycle and message events to observers. Two ways to listen:
//!
//! - `subscribe()` returns a broadcast receiver; dropping it unsubscribes
//! - `observe()` registers a callback and returns an `ObserverHandle` that
//!   `unobserve()` accepts to deregister it
//!
//! Callbacks run on the session's task, in registration-independent order, and
//! must not block.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Something observers may want to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The transport reported an open connection
    Connected,
    /// The transport closed
    Disconnected {
        status_code: u16,
        reason: String,
        was_clean: bool,
    },
    /// A queued message went out
    MessageSent {
        raw: String,
        timestamp: DateTime<Utc>,
    },
    /// Any inbound message, before kind-specific handling
    MessageReceived {
        raw: String,
        timestamp: DateTime<Utc>,
    },
    PlayerAuthenticated {
        player_name: String,
        player_id: String,
    },
    /// Server-sent warning text
    Warning { message: String },
    /// Server-sent error text
    Error { message: String },
    /// A local failure (setup, transport, decoding)
    InternalError { message: String },
}

/// Identifies a registered observer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

pub type Observer = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Event fan-out shared between a session and its listeners.
#[derive(Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<SessionEvent>,
    observers: Arc<DashMap<u64, Observer>>,
    next_id: Arc<AtomicU64>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Deliver an event to every observer and subscriber.
    pub fn emit(&self, event: SessionEvent) {
        // Snapshot first so a callback may (un)register without holding a shard lock.
        let observers: Vec<Observer> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for observer in observers {
            observer(&event);
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn observe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, Arc::new(callback));
        ObserverHandle(id)
    }

    /// Returns false if the handle was already removed.
    pub fn unobserve(&self, handle: ObserverHandle) -> bool {
        self.observers.remove(&handle.0).is_some()
    }

    // Convenience emitters

    pub fn message_sent(&self, raw: &str, timestamp: DateTime<Utc>) {
        self.emit(SessionEvent::MessageSent {
            raw: raw.to_string(),
            timestamp,
        });
    }

    pub fn message_received(&self, raw: &str, timestamp: DateTime<Utc>) {
        self.emit(SessionEvent::MessageReceived {
            raw: raw.to_string(),
            timestamp,
        });
    }

    pub fn internal_error(&self, message: impl Into<String>) {
        self.emit(SessionEvent::InternalError {
            message: message.into(),
        });
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
