//! Host platform selection.

use std::fmt;

use serde::Serialize;

use crate::device::{BleDeviceInfo, DeviceInfo, HidDeviceInfo, SerialDeviceInfo};
use crate::enumerate;
use crate::error::{HidportError, Result};
use crate::hid::HidBackend;
use crate::list::DeviceSource;
use crate::serial::SerialBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Unsupported,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Unsupported
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Unsupported => "unsupported",
        }
    }

    /// Native calls only work for the platform we were built for.
    fn require_native(self, what: &str) -> Result<()> {
        if self == Platform::Unsupported || self != Self::current() {
            return Err(HidportError::Unsupported(format!("{what} on {self}")));
        }
        Ok(())
    }

    pub fn enumerate_hid(self) -> Result<Vec<HidDeviceInfo>> {
        self.require_native("HID enumeration")?;
        enumerate::hid_devices()
    }

    pub fn enumerate_serial(self) -> Result<Vec<SerialDeviceInfo>> {
        self.require_native("serial enumeration")?;
        enumerate::serial_devices()
    }

    pub fn enumerate_ble(self) -> Result<Vec<BleDeviceInfo>> {
        self.require_native("BLE enumeration")?;
        enumerate::ble_devices()
    }

    /// Open the native HID backend for `path`.
    pub fn open_hid(self, path: &str) -> Result<Box<dyn HidBackend>> {
        self.require_native("HID streams")?;
        #[cfg(target_os = "linux")]
        {
            Ok(Box::new(crate::hid::linux::LinuxHidBackend::open(path)?))
        }
        #[cfg(windows)]
        {
            Ok(Box::new(crate::hid::windows::WindowsHidBackend::open(path)?))
        }
        #[cfg(not(any(windows, target_os = "linux")))]
        {
            Err(HidportError::Unsupported(format!("HID streams on {self} ({path})")))
        }
    }

    /// Open the native serial backend for `path`.
    pub fn open_serial(self, path: &str) -> Result<Box<dyn SerialBackend>> {
        self.require_native("serial streams")?;
        #[cfg(unix)]
        {
            Ok(Box::new(crate::serial::unix::UnixSerialBackend::open(path)?))
        }
        #[cfg(windows)]
        {
            Ok(Box::new(crate::serial::windows::WindowsSerialBackend::open(path)?))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(HidportError::Unsupported(format!("serial streams on {self} ({path})")))
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl DeviceSource for Platform {
    fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let mut out: Vec<DeviceInfo> = Vec::new();
        out.extend(self.enumerate_hid()?.into_iter().map(DeviceInfo::from));
        out.extend(self.enumerate_serial()?.into_iter().map(DeviceInfo::from));
        out.extend(self.enumerate_ble()?.into_iter().map(DeviceInfo::from));
        Ok(out)
    }
}
