//! Event infrastructure for fastsync-core.
//!
//! Provides `SyncEvent` for user notices and monitoring, and `EventBus` for subscriptions.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Short message meant for the user (sync started, failed, auth rejected...).
    Notice { level: NoticeLevel, message: String },
    /// Cycle progress recomputed.
    Progress {
        /// 0.0 to 100.0
        percent: f64,
        phase: String,
    },
    /// A sync cycle began.
    SyncStarted { incremental: bool },
    /// The running cycle drained completely.
    SyncCompleted,
    /// A remote config write landed; the host may want to reload.
    ConfigChanged { path: String },
    /// Outgoing protocol message.
    MessageSent {
        #[serde(rename = "messageType")]
        message_type: String,
        /// Frame size in bytes.
        size: usize,
    },
    /// Incoming protocol message.
    MessageReceived {
        #[serde(rename = "messageType")]
        message_type: String,
        /// Frame size in bytes.
        size: usize,
    },
}

impl SyncEvent {
    pub fn info(message: impl Into<String>) -> Self {
        SyncEvent::Notice {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        SyncEvent::Notice {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SyncEvent::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
