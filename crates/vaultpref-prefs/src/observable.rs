use std::{fmt, sync::Arc};

use parking_lot::Mutex;

/// Change callback. Receives the new value, or `None` when the entry was removed.
pub type Observer<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

/// Ordered set of change callbacks for one preference.
///
/// Membership is by `Arc` identity, so adding or deleting the same callback
/// twice is a no-op. Notification snapshots the set under the lock and invokes
/// outside it: callbacks may add or delete observers, and those changes apply
/// from the next notification on.
pub struct Observable<T> {
    observers: Mutex<Vec<Observer<T>>>,
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers `observer` unless it is already present; returns it for later removal.
    pub fn add_observer(&self, observer: Observer<T>) -> Observer<T> {
        let mut observers = self.observers.lock();
        if !observers.iter().any(|known| Arc::ptr_eq(known, &observer)) {
            observers.push(Arc::clone(&observer));
        }
        observer
    }

    pub fn observe<F>(&self, callback: F) -> Observer<T>
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(callback))
    }

    /// Returns whether `observer` was registered.
    pub fn delete_observer(&self, observer: &Observer<T>) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|known| !Arc::ptr_eq(known, observer));
        observers.len() != before
    }

    pub fn delete_observers(&self) {
        self.observers.lock().clear();
    }

    pub fn count_observers(&self) -> usize {
        self.observers.lock().len()
    }

    pub(crate) fn notify(&self, value: Option<&T>) {
        let snapshot = self.observers.lock().clone();
        for observer in snapshot {
            observer(value);
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("observers", &self.count_observers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn same_callback_is_registered_once() {
        let observable = Observable::<i32>::new();
        let observer: Observer<i32> = Arc::new(|_| {});

        observable.add_observer(Arc::clone(&observer));
        observable.add_observer(Arc::clone(&observer));
        assert_eq!(observable.count_observers(), 1);

        assert!(observable.delete_observer(&observer));
        assert!(!observable.delete_observer(&observer));
        assert_eq!(observable.count_observers(), 0);
    }

    #[test]
    fn notify_passes_value_to_every_observer() {
        let observable = Observable::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            observable.observe(move |value| seen.lock().push(value.cloned()));
        }

        observable.notify(Some(&"a".to_string()));
        observable.notify(None);

        assert_eq!(
            *seen.lock(),
            vec![Some("a".to_string()), Some("a".to_string()), None, None]
        );
    }

    #[test]
    fn delete_observers_silences_notifications() {
        let observable = Observable::<i32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        observable.observe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observable.delete_observers();
        observable.notify(Some(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observers_added_during_notify_wait_for_the_next_one() {
        let observable = Arc::new(Observable::<i32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&observable);
        let counter = Arc::clone(&calls);
        observable.observe(move |_| {
            let counter = Arc::clone(&counter);
            inner.observe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        observable.notify(Some(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(observable.count_observers(), 2);

        observable.notify(Some(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
