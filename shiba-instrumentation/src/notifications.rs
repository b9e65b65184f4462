//! Messages shown to the user, some of them with a lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::observers::Observers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    pub expires_at: Option<Instant>,
}

impl Notification {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Ordered list of notifications. Every change triggers the redraw
/// observers.
pub struct Notifications {
    entries: Mutex<Vec<Notification>>,
    next_id: AtomicU64,
    default_lifetime: Mutex<Duration>,
    redraw: Observers,
}

impl Notifications {
    pub fn new(default_lifetime: Duration, redraw: Observers) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            default_lifetime: Mutex::new(default_lifetime),
            redraw,
        }
    }

    pub fn set_default_lifetime(&self, lifetime: Duration) {
        *self.default_lifetime.lock() = lifetime;
    }

    /// Add a message that stays until removed, or until `lifetime` elapses.
    /// Expired entries are dropped on the way.
    pub fn add(&self, message: impl Into<String>, lifetime: Option<Duration>) -> NotificationId {
        let id = NotificationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = message.into();
        tracing::info!(notification = %message);
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            entries.retain(|n| !n.is_expired(now));
            entries.push(Notification {
                id,
                message,
                expires_at: lifetime.map(|l| now + l),
            });
        }
        self.redraw.notify();
        id
    }

    /// Add a message with the configured default lifetime.
    pub fn add_timed(&self, message: impl Into<String>) -> NotificationId {
        let lifetime = *self.default_lifetime.lock();
        self.add(message, Some(lifetime))
    }

    pub fn remove(&self, id: NotificationId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|n| n.id != id);
            entries.len() != before
        };
        if removed {
            self.redraw.notify();
        }
        removed
    }

    /// Live notifications, oldest first. Expired ones are dropped.
    pub fn list(&self) -> Vec<Notification> {
        let now = Instant::now();
        let (live, pruned) = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|n| !n.is_expired(now));
            (entries.clone(), entries.len() != before)
        };
        if pruned {
            self.redraw.notify();
        }
        live
    }

    pub fn messages(&self) -> Vec<String> {
        self.list().into_iter().map(|n| n.message).collect()
    }

    pub fn contains(&self, message: &str) -> bool {
        self.list().iter().any(|n| n.message == message)
    }
}
