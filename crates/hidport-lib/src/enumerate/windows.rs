//! SetupDi enumeration of HID interfaces and the SERIALCOMM registry map.

use std::mem;

use windows::Win32::Devices::DeviceAndDriverInstallation::{
    DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO, SP_DEVICE_INTERFACE_DATA,
    SP_DEVICE_INTERFACE_DETAIL_DATA_W, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces,
    SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW,
};
use windows::Win32::Devices::HumanInterfaceDevice::{
    HIDD_ATTRIBUTES, HidD_GetAttributes, HidD_GetHidGuid, HidD_GetManufacturerString,
    HidD_GetProductString, HidD_GetSerialNumberString,
};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::core::{GUID, PCWSTR};
use winreg::RegKey;
use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};

use crate::device::{HidDeviceInfo, SerialDeviceInfo};
use crate::error::Result;
use crate::win::{self, Handle};

/// Upper bound on interfaces walked per class.
const MAX_INTERFACES: u32 = 256;

/// Extract the null-terminated UTF-16 path from an interface detail struct.
///
/// # Safety
/// `detail` must have been filled by `SetupDiGetDeviceInterfaceDetailW`.
unsafe fn extract_path(detail: &SP_DEVICE_INTERFACE_DETAIL_DATA_W) -> String {
    let ptr = &detail.DevicePath as *const u16;
    let mut len = 0;
    // SAFETY: the path is null-terminated within the buffer the caller sized.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

/// Device interface paths of every present interface in `class`.
fn interface_paths(class: &GUID) -> Vec<String> {
    let Ok(dev_info) = (unsafe {
        SetupDiGetClassDevsW(
            Some(class),
            PCWSTR::null(),
            None,
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    }) else {
        return Vec::new();
    };
    let paths = unsafe { interface_paths_inner(dev_info, class) };
    unsafe {
        let _ = SetupDiDestroyDeviceInfoList(dev_info);
    }
    paths
}

unsafe fn interface_paths_inner(dev_info: HDEVINFO, class: &GUID) -> Vec<String> {
    let mut paths = Vec::new();
    for index in 0..MAX_INTERFACES {
        let mut iface = SP_DEVICE_INTERFACE_DATA {
            cbSize: mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };
        // SAFETY: dev_info is live and iface is sized.
        let found =
            unsafe { SetupDiEnumDeviceInterfaces(dev_info, None, class, index, &mut iface) };
        if found.is_err() {
            break;
        }
        let mut req: u32 = 0;
        // SAFETY: size query with no buffer.
        let _ = unsafe {
            SetupDiGetDeviceInterfaceDetailW(dev_info, &iface, None, 0, Some(&mut req), None)
        };
        if req == 0 {
            continue;
        }
        // u32 backing keeps the struct aligned.
        let mut buf = vec![0u32; (req as usize).div_ceil(4)];
        // SAFETY: buf holds req bytes.
        let detail = unsafe { &mut *(buf.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W) };
        detail.cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
        // SAFETY: detail is req bytes with cbSize set.
        if unsafe {
            SetupDiGetDeviceInterfaceDetailW(dev_info, &iface, Some(detail), req, None, None)
        }
        .is_ok()
        {
            // SAFETY: just filled.
            paths.push(unsafe { extract_path(detail) });
        }
    }
    paths
}

/// Open for attribute queries only; works on devices others hold open.
fn query_handle(path: &str) -> Option<Handle> {
    let wide = win::wide(path);
    unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            None,
        )
    }
    .ok()
    .map(Handle)
}

type HidStringFn = unsafe fn(HANDLE, *mut core::ffi::c_void, u32) -> bool;

fn hid_string(handle: HANDLE, get: HidStringFn) -> Option<String> {
    let mut buf = [0u16; 128];
    let ok = unsafe { get(handle, buf.as_mut_ptr().cast(), (buf.len() * 2) as u32) };
    if !ok {
        return None;
    }
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    let s = String::from_utf16_lossy(&buf[..len]);
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn describe_hid(path: String) -> Option<HidDeviceInfo> {
    let handle = query_handle(&path)?;
    let mut attrs = HIDD_ATTRIBUTES {
        Size: mem::size_of::<HIDD_ATTRIBUTES>() as u32,
        ..Default::default()
    };
    if !unsafe { HidD_GetAttributes(handle.raw(), &mut attrs) } {
        log::trace!("{path}: HidD_GetAttributes failed");
        return None;
    }
    Some(HidDeviceInfo {
        vendor_id: attrs.VendorID,
        product_id: attrs.ProductID,
        version: attrs.VersionNumber,
        serial_number: hid_string(handle.raw(), HidD_GetSerialNumberString),
        product: hid_string(handle.raw(), HidD_GetProductString),
        manufacturer: hid_string(handle.raw(), HidD_GetManufacturerString),
        path,
    })
}

pub fn hid_devices() -> Result<Vec<HidDeviceInfo>> {
    let guid = unsafe { HidD_GetHidGuid() };
    Ok(interface_paths(&guid).into_iter().filter_map(describe_hid).collect())
}

/// Ports currently listed under `HARDWARE\DEVICEMAP\SERIALCOMM`. Value names
/// are driver device names (`\Device\Serial0`), values the port names.
pub fn serial_devices() -> Result<Vec<SerialDeviceInfo>> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let Ok(map) = hklm.open_subkey_with_flags(r"HARDWARE\DEVICEMAP\SERIALCOMM", KEY_READ) else {
        return Ok(Vec::new());
    };
    let mut out: Vec<SerialDeviceInfo> = map
        .enum_values()
        .flatten()
        .filter_map(|(driver, _)| {
            let port: String = map.get_value(&driver).ok()?;
            let description = driver.rsplit('\\').next().map(str::to_string);
            Some(SerialDeviceInfo {
                path: port.clone(),
                port_name: port,
                description,
            })
        })
        .collect();
    out.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(out)
}
