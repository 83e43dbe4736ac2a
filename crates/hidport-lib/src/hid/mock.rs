//! In-memory HID backend for unit and integration tests.
//!
//! [`MockHidBackend`] is handed to [`HidStream::start`](super::HidStream::start);
//! the paired [`MockHidControl`] injects input reports, simulates a
//! disconnect and inspects what the stream wrote.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{HidBackend, ReadOutcome};
use crate::descriptor::ReportInfo;
use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};

#[derive(Default)]
struct MockInner {
    input: VecDeque<Vec<u8>>,
    disconnected: bool,
    woken: bool,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
    write_delay: Duration,
    features: HashMap<u8, Vec<u8>>,
    in_flight: usize,
    max_in_flight: usize,
    frees: u32,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<MockInner>,
    cond: Condvar,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MockHidBackend {
    path: String,
    info: ReportInfo,
    state: Arc<MockState>,
}

#[derive(Clone)]
pub struct MockHidControl {
    state: Arc<MockState>,
}

impl MockHidBackend {
    /// A backend with 65-byte input, output and feature reports, no report IDs.
    pub fn new(path: &str) -> (Self, MockHidControl) {
        let info = ReportInfo {
            max_input_len: 65,
            max_output_len: 65,
            max_feature_len: 65,
            uses_report_ids: false,
        };
        Self::with_info(path, info)
    }

    pub fn with_info(path: &str, info: ReportInfo) -> (Self, MockHidControl) {
        let state = Arc::new(MockState::default());
        (
            MockHidBackend {
                path: path.to_string(),
                info,
                state: Arc::clone(&state),
            },
            MockHidControl { state },
        )
    }
}

impl MockHidControl {
    pub fn push_input(&self, report: Vec<u8>) {
        self.state.lock().input.push_back(report);
        self.state.cond.notify_all();
    }

    /// Make the next backend read report a fatal disconnect.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
        self.state.cond.notify_all();
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = delay;
    }

    /// Highest number of output reports ever transmitted at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn free_count(&self) -> u32 {
        self.state.lock().frees
    }
}

impl HidBackend for MockHidBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn report_info(&self) -> ReportInfo {
        self.info
    }

    fn read_report(&self, poll: Duration) -> Result<ReadOutcome> {
        let mut inner = self.state.lock();
        if inner.input.is_empty() && !inner.disconnected && !inner.woken {
            inner = self
                .state
                .cond
                .wait_timeout(inner, poll)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if let Some(report) = inner.input.pop_front() {
            return Ok(ReadOutcome::Report(report));
        }
        if inner.disconnected {
            return Ok(ReadOutcome::Disconnected);
        }
        Ok(ReadOutcome::Idle)
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        let delay = {
            let mut inner = self.state.lock();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            inner.write_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut inner = self.state.lock();
        inner.in_flight -= 1;
        if inner.fail_writes {
            return Err(HidportError::Device(DeviceIoError::new(
                IoErrorKind::Native,
                &self.path,
                "mock: write failure injected",
            )));
        }
        inner.written.push(data.to_vec());
        Ok(())
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize> {
        let id = buf.first().copied().unwrap_or(0);
        let inner = self.state.lock();
        let Some(report) = inner.features.get(&id) else {
            return Err(HidportError::Device(DeviceIoError::new(
                IoErrorKind::Feature,
                &self.path,
                format!("mock: no feature report {id}"),
            )));
        };
        let n = report.len().min(buf.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    fn set_feature(&self, data: &[u8]) -> Result<()> {
        let id = data.first().copied().unwrap_or(0);
        self.state.lock().features.insert(id, data.to_vec());
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
