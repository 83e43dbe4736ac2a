//! Lock-free reference count guarding a native handle's lifetime.
//!
//! Every I/O operation takes a reference before touching the handle and
//! drops it afterwards; `close` drops the initial reference. Whoever drives
//! the count to zero frees the handle, exactly once.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{HidportError, Result};

#[derive(Debug, Default)]
pub struct RefCountGuard {
    opened: AtomicU32,
    closed: AtomicU32,
    ref_count: AtomicUsize,
}

impl RefCountGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the handle opened; the caller holds the initial reference.
    pub fn open(&self) {
        self.ref_count.store(1, Ordering::SeqCst);
        self.opened.store(1, Ordering::SeqCst);
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst) != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) != 0
    }

    /// Returns `true` only for the first caller.
    pub fn request_close(&self) -> bool {
        self.closed
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Take a reference. Fails once the count has reached zero.
    pub fn acquire(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but rejects new work as soon as close
    /// has been requested.
    pub fn acquire_or_fail(&self) -> Result<()> {
        if self.is_closed() || !self.acquire() {
            return Err(HidportError::Closed);
        }
        Ok(())
    }

    /// Drop a reference. Returns `true` when the caller must free the handle.
    pub fn release(&self) -> bool {
        let previous = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "release without matching acquire");
        previous == 1 && self.is_opened()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/// RAII reference: acquired on construction, released on drop. The free
/// callback runs if this was the last reference.
pub struct RefGuard<'a, F: Fn()> {
    guard: &'a RefCountGuard,
    free: F,
}

impl<'a, F: Fn()> RefGuard<'a, F> {
    pub fn acquire(guard: &'a RefCountGuard, free: F) -> Result<Self> {
        guard.acquire_or_fail()?;
        Ok(RefGuard { guard, free })
    }
}

impl<F: Fn()> Drop for RefGuard<'_, F> {
    fn drop(&mut self) {
        if self.guard.release() {
            (self.free)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn open_sets_single_reference() {
        let g = RefCountGuard::new();
        g.open();
        assert!(g.is_opened());
        assert_eq!(g.ref_count(), 1);
    }

    #[test]
    fn acquire_fails_before_open() {
        let g = RefCountGuard::new();
        assert!(!g.acquire());
    }

    #[test]
    fn request_close_single_winner() {
        let g = RefCountGuard::new();
        g.open();
        assert!(g.request_close());
        assert!(!g.request_close());
        assert!(g.is_closed());
    }

    #[test]
    fn acquire_or_fail_after_close_request() {
        let g = RefCountGuard::new();
        g.open();
        g.request_close();
        assert!(matches!(g.acquire_or_fail(), Err(HidportError::Closed)));
        // Count is untouched by the rejected attempt.
        assert_eq!(g.ref_count(), 1);
    }

    #[test]
    fn last_release_frees() {
        let g = RefCountGuard::new();
        g.open();
        assert!(g.acquire());
        assert!(!g.release());
        assert!(g.release());
        assert!(!g.acquire(), "no resurrection from zero");
    }

    #[test]
    fn release_without_open_never_frees() {
        let g = RefCountGuard::new();
        g.ref_count.store(1, Ordering::SeqCst);
        assert!(!g.release());
    }

    #[test]
    fn ref_guard_frees_when_last() {
        let g = RefCountGuard::new();
        g.open();
        let frees = AtomicU32::new(0);
        {
            let _r = RefGuard::acquire(&g, || {
                frees.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            g.request_close();
            assert!(!g.release(), "close reference is not the last");
        }
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_acquire_release_frees_exactly_once() {
        for _ in 0..20 {
            let g = Arc::new(RefCountGuard::new());
            g.open();
            let frees = Arc::new(AtomicU32::new(0));
            let mut workers = Vec::new();
            for _ in 0..8 {
                let g = Arc::clone(&g);
                let frees = Arc::clone(&frees);
                workers.push(std::thread::spawn(move || {
                    for _ in 0..500 {
                        if g.acquire_or_fail().is_err() {
                            break;
                        }
                        if g.release() {
                            frees.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }));
            }
            std::thread::yield_now();
            if g.request_close() && g.release() {
                frees.fetch_add(1, Ordering::SeqCst);
            }
            for w in workers {
                w.join().unwrap();
            }
            assert_eq!(frees.load(Ordering::SeqCst), 1);
            assert_eq!(g.ref_count(), 0);
        }
    }
}
