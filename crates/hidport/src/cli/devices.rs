//! `devices` subcommand — list HID and serial devices.

use hidport_lib::list::DeviceSource;
use hidport_lib::{Device, DeviceInfo, Platform};

use super::{DevicesOutput, Result, print_json};

pub(super) fn cmd_devices(hid_only: bool, serial_only: bool, json: bool) -> Result<()> {
    let platform = Platform::current();
    let devices: Vec<DeviceInfo> = platform
        .scan()?
        .into_iter()
        .filter(|d| match d {
            DeviceInfo::Hid(_) => !serial_only,
            DeviceInfo::Serial(_) => !hid_only,
            DeviceInfo::Ble(_) => !hid_only && !serial_only,
        })
        .collect();

    if json {
        return print_json(&DevicesOutput {
            platform,
            count: devices.len(),
            devices,
        });
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!(
        "Found {} device{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!("  [{}] {} ({})", i + 1, dev.path(), dev.key().kind);
        println!("      {}", dev.name());
        if let DeviceInfo::Hid(h) = dev {
            println!("      ID: {:04x}:{:04x}", h.vendor_id, h.product_id);
            if let Some(ref serial) = h.serial_number {
                println!("      Serial: {serial}");
            }
        }
    }

    Ok(())
}
