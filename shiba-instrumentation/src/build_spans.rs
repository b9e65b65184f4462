//! Outstanding-build counters behind the "Building..." notification.
//!
//! Builds for different targets may overlap and nest. The notification is
//! added when the total goes from zero to one and removed when it returns to
//! zero, so interleaved start/end events never flicker it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use shiba_protocol::BuildTarget;

use crate::notifications::{NotificationId, Notifications};

pub const BUILDING_MESSAGE: &str = "Building...";

#[derive(Default)]
struct Spans {
    counts: BTreeMap<BuildTarget, u32>,
    notification: Option<NotificationId>,
}

impl Spans {
    fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

pub struct BuildSpans {
    notifications: Arc<Notifications>,
    spans: Mutex<Spans>,
}

impl BuildSpans {
    pub fn new(notifications: Arc<Notifications>) -> Self {
        Self {
            notifications,
            spans: Mutex::new(Spans::default()),
        }
    }

    pub fn started(&self, target: BuildTarget) {
        let mut spans = self.spans.lock();
        if spans.total() == 0 {
            spans.notification = Some(self.notifications.add(BUILDING_MESSAGE, None));
        }
        *spans.counts.entry(target).or_default() += 1;
        tracing::debug!(%target, outstanding = spans.total(), "build started");
    }

    /// Close one span for `target`. Returns `false` for an end without a
    /// matching start, which leaves the counters untouched.
    pub fn ended(&self, target: BuildTarget) -> bool {
        let mut spans = self.spans.lock();
        match spans.counts.get_mut(&target) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                tracing::warn!(%target, "build ended without a matching start");
                return false;
            }
        }
        if spans.total() == 0 {
            if let Some(id) = spans.notification.take() {
                self.notifications.remove(id);
            }
        }
        tracing::debug!(%target, outstanding = spans.total(), "build ended");
        true
    }

    pub fn outstanding(&self, target: BuildTarget) -> u32 {
        self.spans.lock().counts.get(&target).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.spans.lock().total()
    }

    pub fn is_building(&self) -> bool {
        self.total() > 0
    }
}
