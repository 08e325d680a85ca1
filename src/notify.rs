//! Notification fan-out for urgent bus events.
//!
//! The pipeline only sees the [`Notifier`] trait and announces every event it
//! derives. [`NotificationHub`] turns High and Critical events into
//! notifications, keeps the most recent ones and hands each to every
//! registered listener.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::events::{BusEvent, EventPriority};

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1_000;

/// Fire-and-forget announcement of a derived event.
pub trait Notifier: Send + Sync {
    fn announce(&self, event: &BusEvent);
}

/// Receiver of notifications, such as an operator console.
pub trait NotificationListener: Send + Sync {
    fn listener_id(&self) -> &str;

    fn on_notification(&self, notification: &Notification);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub event: BusEvent,
    pub message: String,
}

impl Notification {
    pub fn from_event(event: &BusEvent) -> Self {
        let mut message = String::from("ALERT: ");
        if event.priority == EventPriority::Critical {
            message.push_str("CRITICAL - ");
        }
        message.push_str(event.kind.label());
        message.push_str(&format!(" on bus {}", event.vehicle_code));
        if !event.description.is_empty() {
            message.push_str(" - ");
            message.push_str(&event.description);
        }

        Self {
            event: event.clone(),
            message,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.event.priority == EventPriority::Critical
    }
}

pub struct NotificationHub {
    capacity: usize,
    listeners: RwLock<Vec<Arc<dyn NotificationListener>>>,
    notifications: Mutex<VecDeque<Notification>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            listeners: RwLock::new(Vec::new()),
            notifications: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds a listener unless one with the same id is already registered.
    /// Returns whether it was added.
    pub fn register(&self, listener: Arc<dyn NotificationListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if listeners
            .iter()
            .any(|l| l.listener_id() == listener.listener_id())
        {
            return false;
        }
        info!(listener = listener.listener_id(), "Listener registered");
        listeners.push(listener);
        true
    }

    /// Removes the listener with the given id. Returns whether one was found.
    pub fn unregister(&self, listener_id: &str) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.listener_id() != listener_id);
        let removed = listeners.len() < before;
        if removed {
            info!(listener = listener_id, "Listener unregistered");
        }
        removed
    }

    /// Builds and fans out a notification for a High or Critical event.
    /// Lower priorities are ignored. A panicking listener is logged and does
    /// not keep the others from being notified.
    pub fn deliver(&self, event: &BusEvent) -> Option<Notification> {
        if !event.is_high_priority() {
            return None;
        }
        let notification = Notification::from_event(event);
        self.store(notification.clone());

        let listeners: Vec<Arc<dyn NotificationListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_notification(&notification)));
            if delivered.is_err() {
                error!(
                    listener = listener.listener_id(),
                    event_id = %event.id,
                    "Listener failed while handling notification"
                );
            }
        }
        debug!(listeners = listeners.len(), kind = %event.kind, "Notification delivered");
        Some(notification)
    }

    fn store(&self, notification: Notification) {
        let mut stored = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stored.push_back(notification);
        while stored.len() > self.capacity {
            stored.pop_front();
        }
    }

    /// The last `limit` notifications, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let stored = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = stored.len().saturating_sub(limit);
        stored.iter().skip(skip).cloned().collect()
    }

    pub fn critical(&self, limit: usize) -> Vec<Notification> {
        let stored = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let critical: Vec<&Notification> = stored.iter().filter(|n| n.is_critical()).collect();
        let skip = critical.len().saturating_sub(limit);
        critical.into_iter().skip(skip).cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Notifier for NotificationHub {
    fn announce(&self, event: &BusEvent) {
        self.deliver(event);
    }
}
