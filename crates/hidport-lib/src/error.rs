//! Unified error type for the hidport-lib crate.
//!
//! [`HidportError`] covers every failure a stream, the exclusivity protocol or
//! the named-primitive layer can report. Device I/O failures carry the device
//! they happened on in a [`DeviceIoError`]. `From` impls allow `?` to
//! propagate across module boundaries.

use std::fmt;

/// What kind of device I/O failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    /// The device went away (unplugged, driver unbound).
    Disconnected,
    /// Another process holds the device exclusively.
    SharingViolation,
    /// A native syscall failed.
    Native,
    /// A feature report transfer failed.
    Feature,
}

/// A device I/O failure with the device it happened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIoError {
    pub device: String,
    pub message: String,
    /// Native error code (`errno` / `GetLastError`), when one exists.
    pub code: Option<i32>,
    pub kind: IoErrorKind,
}

impl DeviceIoError {
    pub fn new(kind: IoErrorKind, device: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceIoError {
            device: device.into(),
            message: message.into(),
            code: None,
            kind,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for DeviceIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.device, self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        Ok(())
    }
}

/// Unified error type for hidport-lib operations.
#[derive(Debug)]
pub enum HidportError {
    /// A read, write or lock attempt exceeded its deadline.
    Timeout(&'static str),
    /// Device I/O failure (disconnect, syscall failure, device in use, feature transfer).
    Device(DeviceIoError),
    /// Permission denied opening the device node.
    UnauthorizedAccess { device: String, message: String },
    /// Programming error: double lock, unlocking an unheld lock, bad settings.
    InvalidOperation(String),
    /// The stream was closed.
    Closed,
    /// No such device or resource.
    NotFound(String),
    /// Not available on this platform.
    Unsupported(String),
    /// Filesystem I/O outside of device access (config, sync backing files).
    Io(std::io::Error),
    /// Configuration parse or validation error.
    Config(String),
}

impl HidportError {
    pub fn disconnected(device: impl Into<String>) -> Self {
        HidportError::Device(DeviceIoError::new(
            IoErrorKind::Disconnected,
            device,
            "disconnected",
        ))
    }

    pub fn in_use(device: impl Into<String>) -> Self {
        HidportError::Device(DeviceIoError::new(
            IoErrorKind::SharingViolation,
            device,
            "device in use",
        ))
    }

    /// Wrap a native I/O error with device context.
    ///
    /// `PermissionDenied` becomes [`HidportError::UnauthorizedAccess`] so callers
    /// can prompt for elevated access.
    pub fn native(device: impl Into<String>, context: &str, err: std::io::Error) -> Self {
        let device = device.into();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return HidportError::UnauthorizedAccess {
                device,
                message: format!("{context}: {err}"),
            };
        }
        let mut e = DeviceIoError::new(IoErrorKind::Native, device, format!("{context}: {err}"));
        e.code = err.raw_os_error();
        HidportError::Device(e)
    }

    /// The device I/O kind, if this is a device error.
    pub fn io_kind(&self) -> Option<IoErrorKind> {
        match self {
            HidportError::Device(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HidportError::Timeout(_))
    }
}

impl fmt::Display for HidportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HidportError::Timeout(op) => write!(f, "{op} timed out"),
            HidportError::Device(e) => write!(f, "Device error: {e}"),
            HidportError::UnauthorizedAccess { device, message } => {
                write!(f, "Access denied to {device}: {message}")
            }
            HidportError::InvalidOperation(e) => write!(f, "Invalid operation: {e}"),
            HidportError::Closed => write!(f, "Stream is closed"),
            HidportError::NotFound(e) => write!(f, "Not found: {e}"),
            HidportError::Unsupported(e) => write!(f, "Unsupported: {e}"),
            HidportError::Io(e) => write!(f, "I/O error: {e}"),
            HidportError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for HidportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HidportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceIoError> for HidportError {
    fn from(e: DeviceIoError) -> Self {
        HidportError::Device(e)
    }
}

impl From<std::io::Error> for HidportError {
    fn from(e: std::io::Error) -> Self {
        HidportError::Io(e)
    }
}

#[cfg(unix)]
impl From<nix::Error> for HidportError {
    fn from(e: nix::Error) -> Self {
        HidportError::Io(std::io::Error::from(e))
    }
}

/// Crate-level Result alias using [`HidportError`].
pub type Result<T> = std::result::Result<T, HidportError>;
