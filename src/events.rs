use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

/// A shared callback slot. Callbacks take the event by reference and must be
/// `Send + Sync` because emission can happen from any task.
type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An explicit observer registry.
///
/// Listeners are registered with [`subscribe`](Listeners::subscribe), which
/// returns a [`ListenerHandle`] that cancels the registration. Emission
/// clones the callback list and invokes each listener *outside* the internal
/// lock; a panicking listener is trapped and logged, never propagated to the
/// emitter.
pub struct Listeners<E> {
    inner: Arc<Mutex<HashMap<u64, Callback<E>>>>,
    next_id: AtomicU64,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener. The registration stays active until the returned
    /// handle's [`cancel`](ListenerHandle::cancel) is called or the registry
    /// is dropped.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, Arc::new(listener));
        }
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Number of active registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |map| map.len())
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every registered listener.
    ///
    /// The callback list is snapshotted under the lock, then invoked with the
    /// lock released, so a listener may re-enter the registry (subscribe or
    /// cancel) without deadlocking. Listener panics are trapped and logged.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = match self.inner.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return,
        };
        for cb in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| cb(event)));
            if result.is_err() {
                warn!("event listener panicked; registration left in place");
            }
        }
    }
}

/// Cancellation handle for a single listener registration.
///
/// Dropping the handle does *not* cancel the registration; cancellation is
/// explicit so that fire-and-forget subscriptions (a logging hook, a metrics
/// hook) can be registered without keeping the handle alive.
pub struct ListenerHandle<E> {
    id: u64,
    registry: Weak<Mutex<HashMap<u64, Callback<E>>>>,
}

impl<E> ListenerHandle<E> {
    /// Remove the listener. Idempotent; harmless after the registry is gone.
    pub fn cancel(&self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Ok(mut map) = inner.lock() {
                map.remove(&self.id);
            }
        }
    }

    /// Whether the listener is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .and_then(|inner| inner.lock().ok().map(|map| map.contains_key(&self.id)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_all_listeners() {
        let listeners: Listeners<u32> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _h1 = listeners.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _h2 = listeners.subscribe(move |v| {
            c2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn cancel_removes_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let handle = listeners.subscribe(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_active());

        listeners.emit(&());
        handle.cancel();
        assert!(!handle.is_active());
        listeners.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let listeners: Listeners<()> = Listeners::new();
        let handle = listeners.subscribe(|()| {});
        handle.cancel();
        handle.cancel();
        assert!(listeners.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_break_emitter() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _bad = listeners.subscribe(|()| panic!("listener bug"));
        let c = Arc::clone(&count);
        let _good = listeners.subscribe(move |()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1, "good listener still ran");
    }

    #[test]
    fn dropping_handle_keeps_registration() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        {
            let _handle = listeners.subscribe(move |()| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_reenter_registry_during_emit() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let inner = Arc::clone(&listeners);
        let handle = listeners.subscribe(move |()| {
            // Subscribing from inside a callback must not deadlock.
            let h = inner.subscribe(|()| {});
            h.cancel();
        });
        listeners.emit(&());
        handle.cancel();
    }
}
