//! Enumerated device identities.
//!
//! A device description holds no OS handle; opening is a separate step that
//! goes through the [`Context`] so exclusive opens share one named-primitive
//! namespace.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;

use crate::config::OpenConfiguration;
use crate::context::Context;
use crate::error::{HidportError, Result};
use crate::hid::HidStream;
use crate::open::{open_with, panic_message, try_open_with};
use crate::serial::SerialStream;
use crate::stream::DeviceStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Hid,
    Serial,
    Ble,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Hid => "hid",
            DeviceKind::Serial => "serial",
            DeviceKind::Ble => "ble",
        })
    }
}

/// Identity used to diff enumeration snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub path: String,
}

impl DeviceKey {
    pub fn new(kind: DeviceKind, path: impl Into<String>) -> Self {
        DeviceKey {
            kind,
            path: path.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.path)
    }
}

/// Common surface of every enumerated device.
pub trait Device: Send + Sync {
    fn key(&self) -> DeviceKey;

    fn path(&self) -> &str;

    /// Human-readable name for listings.
    fn name(&self) -> String;

    /// Open as a type-erased stream.
    fn open_stream(
        &self,
        ctx: &Context,
        config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>>;

    /// [`open_stream`](Self::open_stream) that never panics.
    fn try_open_stream(
        &self,
        ctx: &Context,
        config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>> {
        match catch_unwind(AssertUnwindSafe(|| self.open_stream(ctx, config))) {
            Ok(result) => result,
            Err(panic) => Err(HidportError::InvalidOperation(format!(
                "{}: open panicked: {}",
                self.path(),
                panic_message(&*panic)
            ))),
        }
    }
}

// ── HID ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HidDeviceInfo {
    /// Platform device path (`/dev/hidraw3`, `\\?\hid#...`).
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (`bcdDevice`), when the platform reports it.
    pub version: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

impl HidDeviceInfo {
    /// A description carrying only a path, for opening devices that were not
    /// enumerated.
    pub fn from_path(path: impl Into<String>) -> Self {
        HidDeviceInfo {
            path: path.into(),
            vendor_id: 0,
            product_id: 0,
            version: 0,
            serial_number: None,
            product: None,
            manufacturer: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    pub fn open(&self, ctx: &Context, config: &OpenConfiguration) -> Result<HidStream> {
        let stream = open_with(ctx.events(), &self.path, config, || self.open_native(ctx))?;
        ctx.apply_default_timeouts(&stream);
        Ok(stream)
    }

    pub fn try_open(&self, ctx: &Context, config: &OpenConfiguration) -> Result<HidStream> {
        let stream = try_open_with(ctx.events(), &self.path, config, || self.open_native(ctx))?;
        ctx.apply_default_timeouts(&stream);
        Ok(stream)
    }

    fn open_native(&self, ctx: &Context) -> Result<HidStream> {
        HidStream::start(ctx.platform().open_hid(&self.path)?)
    }
}

impl Device for HidDeviceInfo {
    fn key(&self) -> DeviceKey {
        DeviceKey::new(DeviceKind::Hid, &self.path)
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{m} {p}"),
            (None, Some(p)) => p.clone(),
            _ => format!("HID {:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }

    fn open_stream(
        &self,
        ctx: &Context,
        config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>> {
        Ok(Box::new(self.open(ctx, config)?))
    }
}

// ── Serial ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialDeviceInfo {
    /// Path handed to the OS open (`/dev/ttyUSB0`, `COM3`).
    pub path: String,
    /// Short port name (`ttyUSB0`, `COM3`).
    pub port_name: String,
    /// Driver or product description, when known.
    pub description: Option<String>,
}

impl SerialDeviceInfo {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let port_name = path.rsplit(['/', '\\']).next().unwrap_or(&path).to_string();
        SerialDeviceInfo {
            path,
            port_name,
            description: None,
        }
    }

    pub fn open(&self, ctx: &Context, config: &OpenConfiguration) -> Result<SerialStream> {
        let stream = open_with(ctx.events(), &self.path, config, || self.open_native(ctx))?;
        ctx.apply_default_timeouts(&stream);
        Ok(stream)
    }

    pub fn try_open(&self, ctx: &Context, config: &OpenConfiguration) -> Result<SerialStream> {
        let stream = try_open_with(ctx.events(), &self.path, config, || self.open_native(ctx))?;
        ctx.apply_default_timeouts(&stream);
        Ok(stream)
    }

    fn open_native(&self, ctx: &Context) -> Result<SerialStream> {
        Ok(SerialStream::new(ctx.platform().open_serial(&self.path)?))
    }
}

impl Device for SerialDeviceInfo {
    fn key(&self) -> DeviceKey {
        DeviceKey::new(DeviceKind::Serial, &self.path)
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn name(&self) -> String {
        match &self.description {
            Some(d) => format!("{} ({d})", self.port_name),
            None => self.port_name.clone(),
        }
    }

    fn open_stream(
        &self,
        ctx: &Context,
        config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>> {
        Ok(Box::new(self.open(ctx, config)?))
    }
}

// ── BLE ──

/// Bluetooth LE device. GATT access is not implemented; opening fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleDeviceInfo {
    pub path: String,
    pub name: Option<String>,
}

impl Device for BleDeviceInfo {
    fn key(&self) -> DeviceKey {
        DeviceKey::new(DeviceKind::Ble, &self.path)
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.path.clone())
    }

    fn open_stream(
        &self,
        _ctx: &Context,
        _config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>> {
        Err(HidportError::Unsupported("Bluetooth LE streams".into()))
    }
}

// ── Any ──

/// One entry of a device list snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceInfo {
    Hid(HidDeviceInfo),
    Serial(SerialDeviceInfo),
    Ble(BleDeviceInfo),
}

impl DeviceInfo {
    fn inner(&self) -> &dyn Device {
        match self {
            DeviceInfo::Hid(d) => d,
            DeviceInfo::Serial(d) => d,
            DeviceInfo::Ble(d) => d,
        }
    }

    pub fn as_hid(&self) -> Option<&HidDeviceInfo> {
        match self {
            DeviceInfo::Hid(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&SerialDeviceInfo> {
        match self {
            DeviceInfo::Serial(d) => Some(d),
            _ => None,
        }
    }
}

impl Device for DeviceInfo {
    fn key(&self) -> DeviceKey {
        self.inner().key()
    }

    fn path(&self) -> &str {
        match self {
            DeviceInfo::Hid(d) => &d.path,
            DeviceInfo::Serial(d) => &d.path,
            DeviceInfo::Ble(d) => &d.path,
        }
    }

    fn name(&self) -> String {
        self.inner().name()
    }

    fn open_stream(
        &self,
        ctx: &Context,
        config: &OpenConfiguration,
    ) -> Result<Box<dyn DeviceStream>> {
        self.inner().open_stream(ctx, config)
    }
}

impl From<HidDeviceInfo> for DeviceInfo {
    fn from(d: HidDeviceInfo) -> Self {
        DeviceInfo::Hid(d)
    }
}

impl From<SerialDeviceInfo> for DeviceInfo {
    fn from(d: SerialDeviceInfo) -> Self {
        DeviceInfo::Serial(d)
    }
}

impl From<BleDeviceInfo> for DeviceInfo {
    fn from(d: BleDeviceInfo) -> Self {
        DeviceInfo::Ble(d)
    }
}
