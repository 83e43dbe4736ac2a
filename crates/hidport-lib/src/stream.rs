//! Common stream contract shared by HID and serial streams.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{ObserverId, Observers};

/// Default read/write timeout.
pub const DEFAULT_TIMEOUT_MS: u32 = 3000;

/// A read or write timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeout {
    /// Block until the operation completes or the stream is closed.
    Infinite,
    Millis(u32),
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Millis(DEFAULT_TIMEOUT_MS)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Infinite => write!(f, "infinite"),
            Timeout::Millis(ms) => write!(f, "{ms} ms"),
        }
    }
}

impl Timeout {
    /// Negative values mean [`Timeout::Infinite`].
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Infinite
        } else {
            Timeout::Millis(ms.min(u32::MAX as i64) as u32)
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(*ms as u64)),
        }
    }

    fn encode(self) -> u64 {
        match self {
            Timeout::Infinite => u64::MAX,
            Timeout::Millis(ms) => ms as u64,
        }
    }

    fn decode(raw: u64) -> Self {
        if raw == u64::MAX {
            Timeout::Infinite
        } else {
            Timeout::Millis(raw as u32)
        }
    }
}

/// Atomically mutable [`Timeout`], so streams can be shared across threads.
#[derive(Debug)]
pub struct TimeoutCell(AtomicU64);

impl TimeoutCell {
    pub fn new(timeout: Timeout) -> Self {
        TimeoutCell(AtomicU64::new(timeout.encode()))
    }

    pub fn get(&self) -> Timeout {
        Timeout::decode(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, timeout: Timeout) {
        self.0.store(timeout.encode(), Ordering::SeqCst);
    }
}

impl Default for TimeoutCell {
    fn default() -> Self {
        Self::new(Timeout::default())
    }
}

/// A deadline computed once at the start of an operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Timeout) -> Self {
        Deadline(timeout.as_duration().map(|d| Instant::now() + d))
    }

    pub fn never() -> Self {
        Deadline(None)
    }

    /// Time left, `None` for no deadline. Zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }

    /// The remaining time capped at `slice`, for loops that must re-check
    /// some condition periodically.
    pub fn slice(&self, slice: Duration) -> Duration {
        self.remaining().map_or(slice, |r| r.min(slice))
    }
}

/// Notifications raised by a stream.
#[derive(Default)]
pub struct StreamEvents {
    /// Fires once, after the stream has been closed.
    pub closed: Observers<()>,
    /// Another process with higher priority asked for the device.
    pub interrupt_requested: Observers<()>,
}

/// An open device stream.
pub trait DeviceStream: Send + Sync {
    fn path(&self) -> &str;
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, buf: &[u8]) -> Result<()>;
    fn read_timeout(&self) -> Timeout;
    fn set_read_timeout(&self, timeout: Timeout);
    fn write_timeout(&self) -> Timeout;
    fn set_write_timeout(&self, timeout: Timeout);
    /// Close the stream. Calling it again is a no-op.
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn events(&self) -> &Arc<StreamEvents>;

    fn on_closed(&self, f: Box<dyn Fn() + Send + Sync>) -> ObserverId {
        self.events().closed.add(move |_| f())
    }

    fn on_interrupt_requested(&self, f: Box<dyn Fn() + Send + Sync>) -> ObserverId {
        self.events().interrupt_requested.add(move |_| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_3000ms() {
        assert_eq!(Timeout::default(), Timeout::Millis(3000));
    }

    #[test]
    fn negative_millis_is_infinite() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(250), Timeout::Millis(250));
    }

    #[test]
    fn cell_round_trips() {
        let cell = TimeoutCell::default();
        for t in [
            Timeout::Millis(0),
            Timeout::Millis(17),
            Timeout::Infinite,
            Timeout::Millis(u32::MAX),
        ] {
            cell.set(t);
            assert_eq!(cell.get(), t);
        }
    }

    #[test]
    fn infinite_deadline_never_expires() {
        let d = Deadline::after(Timeout::Infinite);
        assert!(d.remaining().is_none());
        assert!(!d.expired());
        assert_eq!(d.slice(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn zero_deadline_expires_immediately() {
        let d = Deadline::after(Timeout::Millis(0));
        assert!(d.expired());
        assert_eq!(d.slice(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn display_timeout() {
        assert_eq!(Timeout::Infinite.to_string(), "infinite");
        assert_eq!(Timeout::Millis(5).to_string(), "5 ms");
    }
}
