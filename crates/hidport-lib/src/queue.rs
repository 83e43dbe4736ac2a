//! Blocking report queues shared by every HID backend.
//!
//! [`InputQueue`] carries input reports from the reader thread to `read`
//! callers, plus a disconnect sentinel. [`OutputQueue`] hands one output
//! report at a time to the writer thread and lets the producer wait for that
//! exact report to be transmitted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};
use crate::stream::Deadline;

/// Reports kept before the oldest is dropped.
pub const MAX_QUEUED_INPUT_REPORTS: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wait on `cond` until notified or the deadline passes.
fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>, deadline: &Deadline) -> MutexGuard<'a, T> {
    match deadline.remaining() {
        None => cond.wait(guard).unwrap_or_else(|e| e.into_inner()),
        Some(left) => {
            cond.wait_timeout(guard, left)
                .unwrap_or_else(|e| e.into_inner())
                .0
        }
    }
}

// ── Input ──

struct InputState {
    /// `None` is the disconnect sentinel.
    reports: VecDeque<Option<Vec<u8>>>,
    shutdown: bool,
}

pub struct InputQueue {
    state: Mutex<InputState>,
    cond: Condvar,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputQueue {
    pub fn new() -> Self {
        InputQueue {
            state: Mutex::new(InputState {
                reports: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, report: Vec<u8>) {
        let mut state = lock(&self.state);
        if state.reports.len() >= MAX_QUEUED_INPUT_REPORTS {
            log::trace!("input queue full, dropping oldest report");
            state.reports.pop_front();
        }
        state.reports.push_back(Some(report));
        self.cond.notify_all();
    }

    /// Queue the disconnect sentinel. Returns `false` if one is already queued.
    pub fn push_disconnect(&self) -> bool {
        let mut state = lock(&self.state);
        if state.reports.iter().any(Option::is_none) {
            return false;
        }
        state.reports.push_back(None);
        self.cond.notify_all();
        true
    }

    /// Wait for the next report.
    ///
    /// The disconnect sentinel is never consumed: once it reaches the front
    /// every call fails with `Disconnected`.
    pub fn pop(&self, deadline: Deadline, device: &str) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return Err(HidportError::Closed);
            }
            match state.reports.front() {
                Some(None) => return Err(HidportError::disconnected(device)),
                Some(Some(_)) => {
                    if let Some(Some(report)) = state.reports.pop_front() {
                        return Ok(report);
                    }
                }
                None => {
                    if deadline.expired() {
                        return Err(HidportError::Timeout("read"));
                    }
                    state = wait(&self.cond, state, &deadline);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter; subsequent pops fail with `Closed`.
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cond.notify_all();
    }
}

// ── Output ──

/// One output report handed to the writer thread.
pub struct OutputEntry {
    pub data: Vec<u8>,
    done: AtomicBool,
    done_ok: AtomicBool,
}

impl OutputEntry {
    fn new(data: Vec<u8>) -> Self {
        OutputEntry {
            data,
            done: AtomicBool::new(false),
            done_ok: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

struct OutputState {
    /// Entry waiting for the writer; at most one.
    unsent: Option<Arc<OutputEntry>>,
    shutdown: bool,
}

pub struct OutputQueue {
    state: Mutex<OutputState>,
    cond: Condvar,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputQueue {
    pub fn new() -> Self {
        OutputQueue {
            state: Mutex::new(OutputState {
                unsent: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Queue `data` and block until the writer has transmitted it.
    pub fn submit(&self, data: Vec<u8>, deadline: Deadline, device: &str) -> Result<()> {
        let entry = Arc::new(OutputEntry::new(data));
        let mut state = lock(&self.state);

        // Serialize producers: wait for the previous report to be picked up.
        while state.unsent.is_some() {
            if state.shutdown {
                return Err(HidportError::Closed);
            }
            if deadline.expired() {
                return Err(HidportError::Timeout("write"));
            }
            state = wait(&self.cond, state, &deadline);
        }
        if state.shutdown {
            return Err(HidportError::Closed);
        }
        state.unsent = Some(Arc::clone(&entry));
        self.cond.notify_all();

        while !entry.is_done() {
            if state.shutdown {
                return Err(HidportError::Closed);
            }
            if deadline.expired() {
                // Never transmit a report whose producer already gave up.
                if state
                    .unsent
                    .as_ref()
                    .is_some_and(|e| Arc::ptr_eq(e, &entry))
                {
                    state.unsent = None;
                    self.cond.notify_all();
                }
                return Err(HidportError::Timeout("write"));
            }
            state = wait(&self.cond, state, &deadline);
        }

        if entry.done_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HidportError::Device(DeviceIoError::new(
                IoErrorKind::Native,
                device,
                "output report write failed",
            )))
        }
    }

    /// Writer side: block until an entry is queued. `None` after shutdown.
    pub fn next(&self) -> Option<Arc<OutputEntry>> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(entry) = state.unsent.take() {
                self.cond.notify_all();
                return Some(entry);
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Writer side: mark `entry` transmitted and wake its producer.
    pub fn complete(&self, entry: &OutputEntry, ok: bool) {
        let _state = lock(&self.state);
        entry.done_ok.store(ok, Ordering::SeqCst);
        entry.done.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn has_unsent(&self) -> bool {
        lock(&self.state).unsent.is_some()
    }

    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shutdown = true;
        state.unsent = None;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Timeout;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn ms(n: u32) -> Deadline {
        Deadline::after(Timeout::Millis(n))
    }

    // ── Input ──

    #[test]
    fn pop_returns_reports_in_order() {
        let q = InputQueue::new();
        q.push(vec![1]);
        q.push(vec![2]);
        assert_eq!(q.pop(ms(10), "dev").unwrap(), vec![1]);
        assert_eq!(q.pop(ms(10), "dev").unwrap(), vec![2]);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q = InputQueue::new();
        let start = Instant::now();
        let err = q.pop(ms(50), "dev").unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn pop_wakes_on_push_from_other_thread() {
        let q = Arc::new(InputQueue::new());
        let producer = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.push(vec![9, 9]);
        });
        assert_eq!(q.pop(ms(2000), "dev").unwrap(), vec![9, 9]);
        t.join().unwrap();
    }

    #[test]
    fn disconnect_sentinel_is_sticky_and_idempotent() {
        let q = InputQueue::new();
        q.push(vec![1]);
        assert!(q.push_disconnect());
        assert!(!q.push_disconnect());
        assert_eq!(q.pop(ms(10), "dev").unwrap(), vec![1]);
        for _ in 0..3 {
            let err = q.pop(ms(10), "dev").unwrap_err();
            assert_eq!(err.io_kind(), Some(IoErrorKind::Disconnected));
        }
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn shutdown_wakes_blocked_pop() {
        let q = Arc::new(InputQueue::new());
        let closer = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.shutdown();
        });
        let err = q.pop(Deadline::never(), "dev").unwrap_err();
        assert!(matches!(err, HidportError::Closed));
        t.join().unwrap();
    }

    #[test]
    fn full_queue_drops_oldest() {
        let q = InputQueue::new();
        for i in 0..(MAX_QUEUED_INPUT_REPORTS + 1) {
            q.push(vec![(i % 256) as u8]);
        }
        assert_eq!(q.len(), MAX_QUEUED_INPUT_REPORTS);
        assert_eq!(q.pop(ms(10), "dev").unwrap(), vec![1]);
    }

    // ── Output ──

    fn spawn_writer(
        q: Arc<OutputQueue>,
        delay: Duration,
        ok: bool,
        in_flight: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    ) -> std::thread::JoinHandle<Vec<Vec<u8>>> {
        std::thread::spawn(move || {
            let mut sent = Vec::new();
            while let Some(entry) = q.next() {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(delay);
                sent.push(entry.data.clone());
                in_flight.fetch_sub(1, Ordering::SeqCst);
                q.complete(&entry, ok);
            }
            sent
        })
    }

    #[test]
    fn submit_returns_after_writer_completes() {
        let q = Arc::new(OutputQueue::new());
        let writer = spawn_writer(
            Arc::clone(&q),
            Duration::from_millis(20),
            true,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        q.submit(vec![0, 1, 2], ms(1000), "dev").unwrap();
        q.shutdown();
        assert_eq!(writer.join().unwrap(), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn failed_write_reports_device_error() {
        let q = Arc::new(OutputQueue::new());
        let writer = spawn_writer(
            Arc::clone(&q),
            Duration::ZERO,
            false,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let err = q.submit(vec![1], ms(1000), "dev").unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrorKind::Native));
        q.shutdown();
        writer.join().unwrap();
    }

    #[test]
    fn concurrent_submits_single_in_flight() {
        let q = Arc::new(OutputQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let writer = spawn_writer(
            Arc::clone(&q),
            Duration::from_millis(5),
            true,
            Arc::clone(&in_flight),
            Arc::clone(&max_seen),
        );
        let producers: Vec<_> = (0..6u8)
            .map(|i| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || q.submit(vec![i], ms(5000), "dev"))
            })
            .collect();
        for p in producers {
            p.join().unwrap().unwrap();
        }
        q.shutdown();
        let sent = writer.join().unwrap();
        assert_eq!(sent.len(), 6);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_times_out_without_writer_and_withdraws_entry() {
        let q = OutputQueue::new();
        let err = q.submit(vec![1], ms(30), "dev").unwrap_err();
        assert!(err.is_timeout());
        assert!(!q.has_unsent(), "abandoned report must not be sent later");
    }

    #[test]
    fn shutdown_fails_pending_submit() {
        let q = Arc::new(OutputQueue::new());
        let closer = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.shutdown();
        });
        let err = q.submit(vec![1], Deadline::never(), "dev").unwrap_err();
        assert!(matches!(err, HidportError::Closed));
        t.join().unwrap();
        assert!(q.next().is_none());
    }
}
