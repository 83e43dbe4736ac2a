//! Platform device enumeration.
//!
//! Each function returns a fresh snapshot. On platforms without an
//! implementation the lists are empty rather than errors, so a device list
//! can poll everywhere.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(windows)]
pub mod windows;

use crate::device::{BleDeviceInfo, HidDeviceInfo, SerialDeviceInfo};
use crate::error::Result;

pub fn hid_devices() -> Result<Vec<HidDeviceInfo>> {
    #[cfg(target_os = "linux")]
    {
        linux::hid_devices()
    }
    #[cfg(windows)]
    {
        windows::hid_devices()
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Ok(Vec::new())
    }
}

pub fn serial_devices() -> Result<Vec<SerialDeviceInfo>> {
    #[cfg(target_os = "linux")]
    {
        linux::serial_devices()
    }
    #[cfg(windows)]
    {
        windows::serial_devices()
    }
    #[cfg(target_os = "macos")]
    {
        macos::serial_devices()
    }
    #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}

/// GATT is not modelled; always empty.
pub fn ble_devices() -> Result<Vec<BleDeviceInfo>> {
    Ok(Vec::new())
}
