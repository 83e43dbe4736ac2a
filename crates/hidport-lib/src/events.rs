//! Observer lists for stream and device-list notifications.
//!
//! Callbacks fire on whatever thread raised the notification. The list is
//! snapshotted before dispatch, so a callback may add or remove observers
//! (including itself) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`Observers::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observers<T> {
    next_id: AtomicU64,
    list: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Observers {
            next_id: AtomicU64::new(1),
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut list = self.list.lock().unwrap_or_else(|e| e.into_inner());
        list.push((id, Arc::new(callback)));
        ObserverId(id)
    }

    /// Returns `false` if the observer was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut list = self.list.lock().unwrap_or_else(|e| e.into_inner());
        let before = list.len();
        list.retain(|(i, _)| *i != id.0);
        list.len() != before
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let list = self.list.lock().unwrap_or_else(|e| e.into_inner());
            list.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn notify_calls_every_observer() {
        let obs = Observers::<u32>::new();
        let total = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            obs.add(move |v| {
                total.fetch_add(*v, Ordering::SeqCst);
            });
        }
        obs.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn remove_unregisters() {
        let obs = Observers::<()>::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let id = obs.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(obs.remove(id));
        assert!(!obs.remove(id));
        obs.notify(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(obs.is_empty());
    }

    #[test]
    fn callback_may_register_during_notify() {
        let obs = Arc::new(Observers::<()>::new());
        let inner = Arc::clone(&obs);
        obs.add(move |_| {
            inner.add(|_| {});
        });
        obs.notify(&());
        assert_eq!(obs.len(), 2);
    }
}
