//! Serial port streams.
//!
//! [`SerialStream`] wraps a per-platform [`SerialBackend`]. Line settings are
//! staged by the setters and pushed to the port only right before the next
//! read or write, so setting several properties in a row costs one syscall.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[doc(hidden)]
pub mod mock;

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{HidportError, Result};
use crate::refcount::{RefCountGuard, RefGuard};
use crate::stream::{Deadline, DeviceStream, StreamEvents, Timeout, TimeoutCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Line settings: baud rate, data bits, parity, stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(f, "{}-{}-{}-{}", self.baud_rate, self.data_bits, parity, stop)
    }
}

impl SerialSettings {
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(HidportError::InvalidOperation(
                "baud rate must be positive".into(),
            ));
        }
        if !(7..=8).contains(&self.data_bits) {
            return Err(HidportError::InvalidOperation(format!(
                "data bits must be 7 or 8, got {}",
                self.data_bits
            )));
        }
        Ok(())
    }
}

/// Native serial handle operations.
pub trait SerialBackend: Send + Sync + 'static {
    fn path(&self) -> &str;
    /// Push line settings to the port. With `discard_buffered`, anything
    /// received or queued under the old settings is dropped.
    fn apply(&self, settings: &SerialSettings, discard_buffered: bool) -> Result<()>;
    /// Block until at least one byte is available, the deadline passes
    /// (`Timeout`) or the stream is woken for close (`Closed`).
    fn read(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize>;
    /// Write all of `buf` before the deadline.
    fn write(&self, buf: &[u8], deadline: Deadline) -> Result<()>;
    fn wake(&self) {}
    /// Release the native handle. Called exactly once.
    fn free(&self);
}

struct Staged {
    settings: SerialSettings,
    changed: bool,
    /// Settings have reached the port at least once.
    applied: bool,
}

/// An open serial port.
pub struct SerialStream {
    backend: Box<dyn SerialBackend>,
    path: String,
    guard: RefCountGuard,
    staged: Mutex<Staged>,
    read_timeout: TimeoutCell,
    write_timeout: TimeoutCell,
    events: Arc<StreamEvents>,
}

impl SerialStream {
    pub fn new(backend: Box<dyn SerialBackend>) -> Self {
        let stream = SerialStream {
            path: backend.path().to_string(),
            backend,
            guard: RefCountGuard::new(),
            staged: Mutex::new(Staged {
                settings: SerialSettings::default(),
                changed: true,
                applied: false,
            }),
            read_timeout: TimeoutCell::default(),
            write_timeout: TimeoutCell::default(),
            events: Arc::new(StreamEvents::default()),
        };
        stream.guard.open();
        stream
    }

    fn reference(&self) -> Result<RefGuard<'_, impl Fn() + '_>> {
        RefGuard::acquire(&self.guard, move || self.free())
    }

    fn free(&self) {
        log::debug!("{}: freeing native handle", self.path);
        self.backend.free();
    }

    pub fn settings(&self) -> SerialSettings {
        self.staged.lock().unwrap_or_else(|e| e.into_inner()).settings
    }

    /// Stage new settings; they take effect before the next read or write.
    pub fn set_settings(&self, settings: SerialSettings) -> Result<()> {
        settings.validate()?;
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        if staged.settings != settings {
            staged.settings = settings;
            staged.changed = true;
        }
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut SerialSettings)) -> Result<()> {
        let mut settings = self.settings();
        f(&mut settings);
        self.set_settings(settings)
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.update(|s| s.baud_rate = baud_rate)
    }

    pub fn set_data_bits(&self, data_bits: u8) -> Result<()> {
        self.update(|s| s.data_bits = data_bits)
    }

    pub fn set_parity(&self, parity: Parity) -> Result<()> {
        self.update(|s| s.parity = parity)
    }

    pub fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()> {
        self.update(|s| s.stop_bits = stop_bits)
    }

    fn apply_pending(&self) -> Result<()> {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        if staged.changed {
            log::debug!("{}: applying {}", self.path, staged.settings);
            // Input that arrived before the first apply belongs to the caller.
            self.backend.apply(&staged.settings, staged.applied)?;
            staged.changed = false;
            staged.applied = true;
        }
        Ok(())
    }
}

impl DeviceStream for SerialStream {
    fn path(&self) -> &str {
        &self.path
    }

    /// Read whatever is available, waiting for at least one byte.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _r = self.reference()?;
        self.apply_pending()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.backend.read(buf, Deadline::after(self.read_timeout.get()))
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let _r = self.reference()?;
        self.apply_pending()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.backend.write(buf, Deadline::after(self.write_timeout.get()))
    }

    fn read_timeout(&self) -> Timeout {
        self.read_timeout.get()
    }

    fn set_read_timeout(&self, timeout: Timeout) {
        self.read_timeout.set(timeout);
    }

    fn write_timeout(&self) -> Timeout {
        self.write_timeout.get()
    }

    fn set_write_timeout(&self, timeout: Timeout) {
        self.write_timeout.set(timeout);
    }

    fn close(&self) {
        if !self.guard.request_close() {
            return;
        }
        self.backend.wake();
        self.events.closed.notify(&());
        if self.guard.release() {
            self.free();
        }
        log::debug!("{}: closed", self.path);
    }

    fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    fn events(&self) -> &Arc<StreamEvents> {
        &self.events
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        self.close();
    }
}
