//! Subscriber registry
//!
//! Generic pub-sub used by the dispatcher (notification routing) and the
//! lifecycle client (server.* events). Each registration returns a
//! [`Subscription`] handle; dropping the handle removes exactly that
//! callback, so disposing a client unsubscribes everything it registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

type Entries<T> = Mutex<Vec<(u64, Callback<T>)>>;

/// Ordered list of callbacks registered against one event channel
pub struct SubscriberList<T> {
    entries: Arc<Entries<T>>,
    next_token: AtomicU64,
}

impl<T> SubscriberList<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a callback; the returned handle unregisters it on drop
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.entries
            .lock()
            .unwrap()
            .push((token, Arc::new(callback)));

        Subscription {
            entries: Arc::downgrade(&self.entries),
            token,
        }
    }

    /// Invoke every registered callback in registration order
    ///
    /// Callbacks are cloned out before invocation so a callback may
    /// subscribe or unsubscribe without deadlocking the list.
    pub fn fire(&self, params: &T) {
        let callbacks: Vec<Callback<T>> = {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in callbacks {
            callback(params);
        }
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SubscriberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposable registration handle
///
/// Removes exactly the entry it was created for, either explicitly via
/// [`Subscription::unsubscribe`] or implicitly on drop. Outlives the list
/// safely: if the list is gone, disposal is a no-op.
pub struct Subscription<T> {
    entries: Weak<Entries<T>>,
    token: u64,
}

impl<T> Subscription<T> {
    /// Remove the registration now instead of waiting for drop
    pub fn unsubscribe(self) {
        // Drop impl does the work
    }

    fn remove(&self) {
        if let Some(entries) = self.entries.upgrade() {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let mut entries = entries.lock().unwrap();
            if let Some(pos) = entries.iter().position(|(token, _)| *token == self.token) {
                entries.remove(pos);
                trace!("Subscription: removed subscriber token {}", self.token);
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_fire() {
        let list: SubscriberList<u32> = SubscriberList::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let _subscription = list.subscribe(move |value| {
            assert_eq!(*value, 42);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        list.fire(&42);
        list.fire(&42);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_entry() {
        let list: SubscriberList<()> = SubscriberList::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = Arc::clone(&first);
        let first_subscription = list.subscribe(move |_| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });

        let second_clone = Arc::clone(&second);
        let _second_subscription = list.subscribe(move |_| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(list.len(), 2);

        first_subscription.unsubscribe();
        assert_eq!(list.len(), 1);

        list.fire(&());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let list: SubscriberList<()> = SubscriberList::new();

        {
            let _subscription = list.subscribe(|_| {});
            assert_eq!(list.len(), 1);
        }

        assert!(list.is_empty());
    }

    #[test]
    fn test_subscription_outlives_list() {
        let subscription = {
            let list: SubscriberList<()> = SubscriberList::new();
            list.subscribe(|_| {})
        };

        // List is gone; dropping the handle must not panic
        drop(subscription);
    }

    #[test]
    fn test_fire_order_matches_registration_order() {
        let list: SubscriberList<()> = SubscriberList::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        let _a = list.subscribe(move |_| order_a.lock().unwrap().push("a"));
        let order_b = Arc::clone(&order);
        let _b = list.subscribe(move |_| order_b.lock().unwrap().push("b"));

        list.fire(&());

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }
}
