//! In-memory serial backend for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{SerialBackend, SerialSettings};
use crate::error::{HidportError, Result};
use crate::stream::Deadline;

#[derive(Default)]
struct Inner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    applied: Vec<SerialSettings>,
    woken: bool,
    frees: u32,
}

#[derive(Default)]
struct State {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl State {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MockSerialBackend {
    path: String,
    state: Arc<State>,
}

#[derive(Clone)]
pub struct MockSerialControl {
    state: Arc<State>,
}

impl MockSerialBackend {
    pub fn new(path: &str) -> (Self, MockSerialControl) {
        let state = Arc::new(State::default());
        (
            MockSerialBackend {
                path: path.to_string(),
                state: Arc::clone(&state),
            },
            MockSerialControl { state },
        )
    }
}

impl MockSerialControl {
    /// Bytes the "remote end" sends.
    pub fn push_rx(&self, data: &[u8]) {
        self.state.lock().rx.extend(data);
        self.state.cond.notify_all();
    }

    /// Everything written to the port so far.
    pub fn tx(&self) -> Vec<u8> {
        self.state.lock().tx.clone()
    }

    /// Settings pushed to the port, in order.
    pub fn applied(&self) -> Vec<SerialSettings> {
        self.state.lock().applied.clone()
    }

    pub fn free_count(&self) -> u32 {
        self.state.lock().frees
    }
}

impl SerialBackend for MockSerialBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn apply(&self, settings: &SerialSettings, discard_buffered: bool) -> Result<()> {
        let mut inner = self.state.lock();
        inner.applied.push(*settings);
        if discard_buffered {
            inner.rx.clear();
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        let mut inner = self.state.lock();
        loop {
            if inner.woken {
                return Err(HidportError::Closed);
            }
            if !inner.rx.is_empty() {
                let n = buf.len().min(inner.rx.len());
                for (dst, src) in buf.iter_mut().zip(inner.rx.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            inner = match deadline.remaining() {
                None => self.state.cond.wait(inner).unwrap_or_else(|e| e.into_inner()),
                Some(left) if left.is_zero() => return Err(HidportError::Timeout("read")),
                Some(left) => {
                    self.state
                        .cond
                        .wait_timeout(inner, left)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn write(&self, buf: &[u8], _deadline: Deadline) -> Result<()> {
        self.state.lock().tx.extend_from_slice(buf);
        Ok(())
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.state.cond.notify_all();
    }

    fn free(&self) {
        self.state.lock().frees += 1;
    }
}
