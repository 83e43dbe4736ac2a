//! hidport — cross-platform HID and serial device streams with cross-process
//! exclusive access.

pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod events;
pub mod exclusive;
pub mod hid;
pub mod list;
pub mod open;
pub mod platform;
pub mod queue;
pub mod refcount;
pub mod serial;
pub mod stream;
pub mod sync;
#[cfg(windows)]
mod win;

pub use config::{OpenConfiguration, Priority, Settings};
pub use context::Context;
pub use device::{
    BleDeviceInfo, Device, DeviceInfo, DeviceKey, DeviceKind, HidDeviceInfo, SerialDeviceInfo,
};
pub use error::HidportError;
pub use hid::HidStream;
pub use list::{DeviceChange, DeviceList};
pub use platform::Platform;
pub use serial::{Parity, SerialSettings, SerialStream, StopBits};
pub use stream::{DeviceStream, Timeout};
