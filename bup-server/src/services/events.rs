//! In-process publish/subscribe between the engine and connected sessions.

use crate::models::{BackupStatus, Correlation};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConfigChanged {
        correlation: Correlation,
    },
    BackupStatusChanged {
        status: BackupStatus,
        correlation: Correlation,
    },
    ClientError {
        message: String,
        correlation: Correlation,
    },
}

impl Event {
    pub fn correlation(&self) -> &Correlation {
        match self {
            Event::ConfigChanged { correlation }
            | Event::BackupStatusChanged { correlation, .. }
            | Event::ClientError { correlation, .. } => correlation,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
}

impl Subscribers {
    fn remove(&self, id: u64) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }
}

/// Synchronous fan-out in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Subscribers>,
}

/// Removes its subscriber when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    bus: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: Event) {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(correlation = %event.correlation(), "Event subscriber panicked");
            }
        }
    }

    pub fn config_changed(&self, correlation: &Correlation) {
        self.publish(Event::ConfigChanged {
            correlation: correlation.clone(),
        });
    }

    pub fn status_changed(&self, status: BackupStatus, correlation: &Correlation) {
        self.publish(Event::BackupStatusChanged {
            status,
            correlation: correlation.clone(),
        });
    }

    pub fn client_error(&self, message: impl Into<String>, correlation: &Correlation) {
        let message = message.into();
        tracing::error!(correlation = %correlation, "{}", message);
        self.publish(Event::ClientError {
            message,
            correlation: correlation.clone(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
