//! sysfs enumeration of hidraw and tty nodes.

use std::fs;
use std::path::Path;

use crate::device::{HidDeviceInfo, SerialDeviceInfo};
use crate::error::Result;

const SYS_CLASS: &str = "/sys/class";
const DEV: &str = "/dev";

pub fn hid_devices() -> Result<Vec<HidDeviceInfo>> {
    hid_devices_in(Path::new(SYS_CLASS), Path::new(DEV))
}

pub fn serial_devices() -> Result<Vec<SerialDeviceInfo>> {
    serial_devices_in(Path::new(SYS_CLASS), Path::new(DEV))
}

/// Fields of a HID `uevent` file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HidUevent {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: Option<String>,
    pub uniq: Option<String>,
}

/// Parse `HID_ID=0003:00000FD9:00000060`, `HID_NAME` and `HID_UNIQ`.
pub fn parse_uevent(text: &str) -> Option<HidUevent> {
    let mut out = HidUevent::default();
    let mut has_id = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "HID_ID" => {
                let mut parts = value.split(':').skip(1);
                let vid = parts.next().and_then(|v| u32::from_str_radix(v, 16).ok())?;
                let pid = parts.next().and_then(|v| u32::from_str_radix(v, 16).ok())?;
                out.vendor_id = vid as u16;
                out.product_id = pid as u16;
                has_id = true;
            }
            "HID_NAME" if !value.is_empty() => out.name = Some(value.to_string()),
            "HID_UNIQ" if !value.is_empty() => out.uniq = Some(value.to_string()),
            _ => {}
        }
    }
    has_id.then_some(out)
}

fn read_trimmed(path: &Path) -> Option<String> {
    let s = fs::read_to_string(path).ok()?;
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn sorted_entries(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn hid_devices_in(sys_class: &Path, dev: &Path) -> Result<Vec<HidDeviceInfo>> {
    let class = sys_class.join("hidraw");
    let mut out = Vec::new();
    for name in sorted_entries(&class) {
        let device = class.join(&name).join("device");
        let Some(uevent) = fs::read_to_string(device.join("uevent"))
            .ok()
            .as_deref()
            .and_then(parse_uevent)
        else {
            log::trace!("hidraw {name}: no usable uevent");
            continue;
        };
        // device -> USB interface -> USB device carries the string descriptors.
        let usb = device.join("..").join("..");
        let version = read_trimmed(&usb.join("bcdDevice"))
            .and_then(|v| u16::from_str_radix(&v, 16).ok())
            .unwrap_or(0);
        out.push(HidDeviceInfo {
            path: dev.join(&name).to_string_lossy().into_owned(),
            vendor_id: uevent.vendor_id,
            product_id: uevent.product_id,
            version,
            serial_number: uevent.uniq,
            product: read_trimmed(&usb.join("product")).or(uevent.name),
            manufacturer: read_trimmed(&usb.join("manufacturer")),
        });
    }
    Ok(out)
}

/// tty nodes backed by a real device. Legacy 8250 ports without hardware
/// behind them are skipped.
pub fn serial_devices_in(sys_class: &Path, dev: &Path) -> Result<Vec<SerialDeviceInfo>> {
    let class = sys_class.join("tty");
    let mut out = Vec::new();
    for name in sorted_entries(&class) {
        let device = class.join(&name).join("device");
        if !device.exists() {
            continue;
        }
        let driver = fs::read_link(device.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if driver.as_deref() == Some("serial8250") {
            continue;
        }
        // ttyACM hangs off the USB interface, usb-serial ports one level lower.
        let description = read_trimmed(&device.join("../product"))
            .or_else(|| read_trimmed(&device.join("../../product")))
            .or(driver);
        out.push(SerialDeviceInfo {
            path: dev.join(&name).to_string_lossy().into_owned(),
            port_name: name,
            description,
        });
    }
    Ok(out)
}
