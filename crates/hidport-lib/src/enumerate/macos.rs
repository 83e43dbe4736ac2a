//! macOS serial enumeration by `/dev/cu.*` node names.

use std::fs;
use std::path::Path;

use crate::device::SerialDeviceInfo;
use crate::error::Result;

pub fn serial_devices() -> Result<Vec<SerialDeviceInfo>> {
    serial_devices_in(Path::new("/dev"))
}

/// Callout nodes only; the matching `tty.*` nodes block on open until
/// carrier detect.
pub fn serial_devices_in(dev: &Path) -> Result<Vec<SerialDeviceInfo>> {
    let Ok(entries) = fs::read_dir(dev) else {
        return Ok(Vec::new());
    };
    let mut out: Vec<SerialDeviceInfo> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let port = name.strip_prefix("cu.")?.to_string();
            Some(SerialDeviceInfo {
                path: e.path().to_string_lossy().into_owned(),
                port_name: name,
                description: Some(port),
            })
        })
        .collect();
    out.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_callout_nodes_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["cu.usbserial-A1", "tty.usbserial-A1", "cu.Bluetooth-Incoming-Port", "null"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let found = serial_devices_in(dir.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|d| d.port_name.as_str()).collect();
        assert_eq!(names, ["cu.Bluetooth-Incoming-Port", "cu.usbserial-A1"]);
        assert_eq!(found[1].description.as_deref(), Some("usbserial-A1"));
    }
}
