//! HID streams: one engine over per-platform backends.
//!
//! [`HidStream`] owns a backend plus two threads: a reader that pulls input
//! reports into an [`InputQueue`] and a writer that transmits one output
//! report at a time from an [`OutputQueue`]. The native handle is guarded by
//! a [`RefCountGuard`] so `close` never frees it under an in-flight
//! operation.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

#[doc(hidden)]
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::descriptor::ReportInfo;
use crate::error::{HidportError, Result};
use crate::queue::{InputQueue, OutputQueue};
use crate::refcount::{RefCountGuard, RefGuard};
use crate::stream::{Deadline, DeviceStream, StreamEvents, Timeout, TimeoutCell};

/// How long a backend read may block before the reader re-checks shutdown.
pub const READER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one backend read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete input report, report-ID byte first.
    Report(Vec<u8>),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The device is gone.
    Disconnected,
}

/// Native HID handle operations. Called concurrently from the reader thread,
/// the writer thread and feature-report callers.
pub trait HidBackend: Send + Sync + 'static {
    fn path(&self) -> &str;
    fn report_info(&self) -> ReportInfo;
    /// Wait up to `poll` for one input report. Errors are treated as fatal.
    fn read_report(&self, poll: Duration) -> Result<ReadOutcome>;
    /// Blocking write of one output report.
    fn write_report(&self, data: &[u8]) -> Result<()>;
    /// `buf[0]` holds the report ID on entry.
    fn get_feature(&self, buf: &mut [u8]) -> Result<usize>;
    fn set_feature(&self, data: &[u8]) -> Result<()>;
    /// Interrupt blocking calls so the I/O threads can observe shutdown.
    fn wake(&self) {}
    /// Release the native handle. Called exactly once.
    fn free(&self);
}

struct Shared {
    backend: Box<dyn HidBackend>,
    path: String,
    info: ReportInfo,
    guard: RefCountGuard,
    input: InputQueue,
    output: OutputQueue,
    shutdown: AtomicBool,
    read_timeout: TimeoutCell,
    write_timeout: TimeoutCell,
    events: Arc<StreamEvents>,
}

impl Shared {
    fn free(&self) {
        log::debug!("{}: freeing native handle", self.path);
        self.backend.free();
    }

    fn reference(&self) -> Result<RefGuard<'_, impl Fn() + '_>> {
        RefGuard::acquire(&self.guard, move || self.free())
    }
}

/// An open HID device.
pub struct HidStream {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HidStream {
    /// Take ownership of an opened backend and start the I/O threads.
    pub fn start(backend: Box<dyn HidBackend>) -> Result<Self> {
        let path = backend.path().to_string();
        let info = backend.report_info();
        let shared = Arc::new(Shared {
            backend,
            path,
            info,
            guard: RefCountGuard::new(),
            input: InputQueue::new(),
            output: OutputQueue::new(),
            shutdown: AtomicBool::new(false),
            read_timeout: TimeoutCell::default(),
            write_timeout: TimeoutCell::default(),
            events: Arc::new(StreamEvents::default()),
        });
        shared.guard.open();

        let stream = HidStream {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
        };

        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hidport-reader".into())
                .spawn(move || reader_loop(&shared))
        };
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hidport-writer".into())
                .spawn(move || writer_loop(&shared))
        };
        let mut threads = stream.threads.lock().unwrap_or_else(|e| e.into_inner());
        for handle in [reader, writer] {
            match handle {
                Ok(h) => threads.push(h),
                Err(e) => {
                    drop(threads);
                    stream.close();
                    return Err(HidportError::Io(e));
                }
            }
        }
        drop(threads);
        log::debug!(
            "{}: opened (in {} / out {} / feature {} bytes)",
            stream.shared.path,
            info.max_input_len,
            info.max_output_len,
            info.max_feature_len
        );
        Ok(stream)
    }

    pub fn report_info(&self) -> ReportInfo {
        self.shared.info
    }

    pub fn max_input_report_len(&self) -> usize {
        self.shared.info.max_input_len
    }

    pub fn max_output_report_len(&self) -> usize {
        self.shared.info.max_output_len
    }

    pub fn max_feature_report_len(&self) -> usize {
        self.shared.info.max_feature_len
    }

    /// Read a feature report. `buf[0]` selects the report ID.
    pub fn get_feature(&self, buf: &mut [u8]) -> Result<usize> {
        let _r = self.shared.reference()?;
        self.shared.backend.get_feature(buf)
    }

    /// Send a feature report. `data[0]` is the report ID.
    pub fn set_feature(&self, data: &[u8]) -> Result<()> {
        let _r = self.shared.reference()?;
        let max = self.shared.info.max_feature_len;
        let data = if max > 0 && data.len() > max { &data[..max] } else { data };
        self.shared.backend.set_feature(data)
    }

    /// Reports waiting to be read.
    pub fn pending_input_reports(&self) -> usize {
        self.shared.input.len()
    }
}

impl DeviceStream for HidStream {
    fn path(&self) -> &str {
        &self.shared.path
    }

    /// Read one input report; returns the number of bytes copied into `buf`.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let shared = &self.shared;
        let _r = shared.reference()?;
        let deadline = Deadline::after(shared.read_timeout.get());
        let report = shared.input.pop(deadline, &shared.path)?;
        let n = report.len().min(buf.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    /// Write one output report, blocking until it has been transmitted.
    fn write(&self, buf: &[u8]) -> Result<()> {
        let shared = &self.shared;
        let _r = shared.reference()?;
        let max = shared.info.max_output_len;
        let data = if max > 0 && buf.len() > max { &buf[..max] } else { buf };
        let deadline = Deadline::after(shared.write_timeout.get());
        shared.output.submit(data.to_vec(), deadline, &shared.path)
    }

    fn read_timeout(&self) -> Timeout {
        self.shared.read_timeout.get()
    }

    fn set_read_timeout(&self, timeout: Timeout) {
        self.shared.read_timeout.set(timeout);
    }

    fn write_timeout(&self) -> Timeout {
        self.shared.write_timeout.get()
    }

    fn set_write_timeout(&self, timeout: Timeout) {
        self.shared.write_timeout.set(timeout);
    }

    fn close(&self) {
        let shared = &self.shared;
        if !shared.guard.request_close() {
            return;
        }
        shared.shutdown.store(true, Ordering::SeqCst);
        shared.input.shutdown();
        shared.output.shutdown();
        shared.backend.wake();

        let threads: Vec<JoinHandle<()>> = {
            let mut t = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            t.drain(..).collect()
        };
        let current = std::thread::current().id();
        for t in threads {
            if t.thread().id() == current {
                continue;
            }
            if t.join().is_err() {
                log::warn!("{}: I/O thread panicked", shared.path);
            }
        }

        shared.events.closed.notify(&());
        if shared.guard.release() {
            shared.free();
        }
        log::debug!("{}: closed", shared.path);
    }

    fn is_closed(&self) -> bool {
        self.shared.guard.is_closed()
    }

    fn events(&self) -> &Arc<StreamEvents> {
        &self.shared.events
    }
}

impl Drop for HidStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(shared: &Shared) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        match shared.backend.read_report(READER_POLL_INTERVAL) {
            Ok(ReadOutcome::Report(report)) => shared.input.push(report),
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Disconnected) => {
                if !shared.shutdown.load(Ordering::SeqCst) {
                    log::debug!("{}: device disconnected", shared.path);
                    shared.input.push_disconnect();
                }
                break;
            }
            Err(e) => {
                if !shared.shutdown.load(Ordering::SeqCst) {
                    log::warn!("{}: read failed, treating as disconnect: {e}", shared.path);
                    shared.input.push_disconnect();
                }
                break;
            }
        }
    }
}

fn writer_loop(shared: &Shared) {
    while let Some(entry) = shared.output.next() {
        let ok = match shared.backend.write_report(&entry.data) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("{}: output report failed: {e}", shared.path);
                false
            }
        };
        shared.output.complete(&entry, ok);
    }
}
