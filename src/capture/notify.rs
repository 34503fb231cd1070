//! Runtime-failure notifications posted by capture hardware

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

/// A capture device stopped delivering because of a hardware/runtime fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub device: String,
    pub reason: String,
}

type Observer = Arc<dyn Fn(&RuntimeFailure) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: HashMap<u64, Observer>,
}

/// Fan-out point for [`RuntimeFailure`]s. Observers are registered with
/// [`subscribe`](Self::subscribe) and stay registered until the returned
/// [`Subscription`] is dropped.
#[derive(Clone, Default)]
pub struct NotificationCenter {
    registry: Arc<Mutex<Registry>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&RuntimeFailure) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.insert(id, Arc::new(observer));
        debug!(id, "runtime failure observer registered");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `failure` to every observer on the calling thread.
    pub fn post(&self, failure: RuntimeFailure) {
        // Observers run outside the lock so they may subscribe or unsubscribe.
        let observers: Vec<Observer> = lock(&self.registry).observers.values().cloned().collect();
        for observer in observers {
            observer(&failure);
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.registry).observers.len()
    }
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Registration guard; dropping it deregisters the observer.
#[must_use = "dropping a Subscription deregisters the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).observers.remove(&self.id);
            debug!(id = self.id, "runtime failure observer removed");
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failure() -> RuntimeFailure {
        RuntimeFailure {
            device: "cam0".into(),
            reason: "unplugged".into(),
        }
    }

    #[test]
    fn observers_receive_posts_until_dropped() {
        let center = NotificationCenter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let subscription = center.subscribe(move |f| {
            assert_eq!(f.reason, "unplugged");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(center.observer_count(), 1);

        center.post(failure());
        drop(subscription);
        center.post(failure());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(center.observer_count(), 0);
    }

    #[test]
    fn subscription_outliving_center_is_harmless() {
        let center = NotificationCenter::new();
        let subscription = center.subscribe(|_| {});
        drop(center);
        drop(subscription);
    }
}
