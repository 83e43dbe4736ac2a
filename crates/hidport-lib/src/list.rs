//! Polled device list with change notifications.
//!
//! A background thread rescans the [`DeviceSource`] every poll interval,
//! diffs the snapshot by [`DeviceKey`] and notifies `changed` observers with
//! the keys that appeared and disappeared. A failed scan keeps the previous
//! snapshot.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::{Device, DeviceInfo, DeviceKey, HidDeviceInfo, SerialDeviceInfo};
use crate::error::Result;
use crate::events::{ObserverId, Observers};

/// Where the list gets its snapshots.
pub trait DeviceSource: Send + Sync {
    fn scan(&self) -> Result<Vec<DeviceInfo>>;
}

/// Keys that appeared and disappeared between two snapshots, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChange {
    pub added: Vec<DeviceKey>,
    pub removed: Vec<DeviceKey>,
}

impl DeviceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(old: &[DeviceInfo], new: &[DeviceInfo]) -> DeviceChange {
    let old: BTreeSet<DeviceKey> = old.iter().map(Device::key).collect();
    let new: BTreeSet<DeviceKey> = new.iter().map(Device::key).collect();
    DeviceChange {
        added: new.difference(&old).cloned().collect(),
        removed: old.difference(&new).cloned().collect(),
    }
}

struct Shared {
    source: Box<dyn DeviceSource>,
    devices: Mutex<Vec<DeviceInfo>>,
    changed: Observers<DeviceChange>,
    stopped: Mutex<bool>,
    wake: Condvar,
    interval: Duration,
}

impl Shared {
    fn rescan(&self) -> Result<DeviceChange> {
        let fresh = self.source.scan()?;
        let change = {
            let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            let change = diff(&devices, &fresh);
            *devices = fresh;
            change
        };
        if !change.is_empty() {
            log::debug!(
                "device list: {} added, {} removed",
                change.added.len(),
                change.removed.len()
            );
            self.changed.notify(&change);
        }
        Ok(change)
    }

    /// Sleep one interval. Returns `false` once stopped.
    fn sleep(&self) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, self.interval, |s| !*s)
            .unwrap_or_else(|e| e.into_inner());
        !*stopped
    }
}

pub struct DeviceList {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceList {
    /// Scan once, then keep polling every `interval` on a background thread.
    pub fn start(source: Box<dyn DeviceSource>, interval: Duration) -> Result<Self> {
        let initial = source.scan()?;
        let shared = Arc::new(Shared {
            source,
            devices: Mutex::new(initial),
            changed: Observers::new(),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            interval,
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hidport-device-list".into())
                .spawn(move || {
                    while shared.sleep() {
                        if let Err(e) = shared.rescan() {
                            log::warn!("device scan failed: {e}");
                        }
                    }
                })?
        };
        Ok(DeviceList {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn hid_devices(&self) -> Vec<HidDeviceInfo> {
        self.devices()
            .iter()
            .filter_map(DeviceInfo::as_hid)
            .cloned()
            .collect()
    }

    pub fn serial_devices(&self) -> Vec<SerialDeviceInfo> {
        self.devices()
            .iter()
            .filter_map(DeviceInfo::as_serial)
            .cloned()
            .collect()
    }

    /// First HID device with this vendor and product id.
    pub fn find_hid(&self, vendor_id: u16, product_id: u16) -> Option<HidDeviceInfo> {
        self.hid_devices()
            .into_iter()
            .find(|d| d.matches(vendor_id, product_id))
    }

    pub fn on_changed(&self, f: impl Fn(&DeviceChange) + Send + Sync + 'static) -> ObserverId {
        self.shared.changed.add(f)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.changed.remove(id)
    }

    /// Rescan now instead of waiting for the next poll.
    pub fn refresh(&self) -> Result<DeviceChange> {
        self.shared.rescan()
    }

    /// Stop polling. The last snapshot stays readable.
    pub fn stop(&self) {
        *self.shared.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.shared.wake.notify_all();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(t) = thread
            && t.thread().id() != std::thread::current().id()
            && t.join().is_err()
        {
            log::warn!("device list thread panicked");
        }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        self.stop();
    }
}

#[doc(hidden)]
pub mod mock {
    use super::*;
    use crate::error::HidportError;

    /// A source whose snapshot tests replace at will.
    #[derive(Clone, Default)]
    pub struct MockDeviceSource {
        state: Arc<Mutex<(Vec<DeviceInfo>, bool)>>,
    }

    impl MockDeviceSource {
        pub fn new(devices: Vec<DeviceInfo>) -> Self {
            let s = Self::default();
            s.set(devices);
            s
        }

        pub fn set(&self, devices: Vec<DeviceInfo>) {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).0 = devices;
        }

        /// Make subsequent scans fail.
        pub fn fail(&self, fail: bool) {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).1 = fail;
        }
    }

    impl DeviceSource for MockDeviceSource {
        fn scan(&self) -> Result<Vec<DeviceInfo>> {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.1 {
                return Err(HidportError::Unsupported("mock scan failure".into()));
            }
            Ok(state.0.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDeviceSource;
    use super::*;
    use crate::device::{DeviceKind, HidDeviceInfo, SerialDeviceInfo};
    use std::sync::mpsc;

    fn hid(path: &str, vid: u16, pid: u16) -> DeviceInfo {
        let mut d = HidDeviceInfo::from_path(path);
        d.vendor_id = vid;
        d.product_id = pid;
        d.into()
    }

    fn serial(path: &str) -> DeviceInfo {
        SerialDeviceInfo::from_path(path).into()
    }

    // ── diff ──

    #[test]
    fn diff_reports_added_and_removed() {
        let old = vec![hid("/dev/hidraw0", 1, 1), serial("/dev/ttyUSB0")];
        let new = vec![hid("/dev/hidraw0", 1, 1), hid("/dev/hidraw1", 2, 2)];
        let change = diff(&old, &new);
        assert_eq!(change.added, vec![DeviceKey::new(DeviceKind::Hid, "/dev/hidraw1")]);
        assert_eq!(change.removed, vec![DeviceKey::new(DeviceKind::Serial, "/dev/ttyUSB0")]);
    }

    #[test]
    fn identical_snapshots_have_no_change() {
        let snap = vec![hid("/dev/hidraw0", 1, 1)];
        assert!(diff(&snap, &snap).is_empty());
    }

    // ── Polling ──

    #[test]
    fn poll_thread_notifies_changes() {
        let source = MockDeviceSource::new(vec![hid("/dev/hidraw0", 1, 1)]);
        let list = DeviceList::start(Box::new(source.clone()), Duration::from_millis(20)).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        list.on_changed(move |c| {
            let _ = tx.lock().unwrap().send(c.clone());
        });

        source.set(vec![hid("/dev/hidraw0", 1, 1), serial("/dev/ttyACM0")]);
        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change.added, vec![DeviceKey::new(DeviceKind::Serial, "/dev/ttyACM0")]);
        assert!(change.removed.is_empty());
        assert_eq!(list.serial_devices().len(), 1);
        list.stop();
    }

    #[test]
    fn failed_scan_keeps_snapshot() {
        let source = MockDeviceSource::new(vec![hid("/dev/hidraw0", 1, 1)]);
        let list = DeviceList::start(Box::new(source.clone()), Duration::from_secs(60)).unwrap();
        source.fail(true);
        assert!(list.refresh().is_err());
        assert_eq!(list.devices().len(), 1);
    }

    #[test]
    fn refresh_without_change_does_not_notify() {
        let source = MockDeviceSource::new(vec![hid("/dev/hidraw0", 1, 1)]);
        let list = DeviceList::start(Box::new(source), Duration::from_secs(60)).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let tx = Mutex::new(tx);
        let id = list.on_changed(move |_| {
            let _ = tx.lock().unwrap().send(());
        });
        assert!(list.refresh().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
        assert!(list.remove_observer(id));
    }

    #[test]
    fn initial_scan_failure_is_an_error() {
        let source = MockDeviceSource::default();
        source.fail(true);
        assert!(DeviceList::start(Box::new(source), Duration::from_secs(1)).is_err());
    }

    // ── Helpers ──

    #[test]
    fn find_hid_by_ids() {
        let source = MockDeviceSource::new(vec![
            serial("/dev/ttyUSB0"),
            hid("/dev/hidraw0", 0x0fd9, 0x0060),
            hid("/dev/hidraw1", 0x046d, 0xc52b),
        ]);
        let list = DeviceList::start(Box::new(source), Duration::from_secs(60)).unwrap();
        assert_eq!(list.hid_devices().len(), 2);
        assert_eq!(list.find_hid(0x046d, 0xc52b).unwrap().path, "/dev/hidraw1");
        assert!(list.find_hid(0xdead, 0xbeef).is_none());
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let list = DeviceList::start(Box::new(MockDeviceSource::default()), Duration::from_secs(60))
            .unwrap();
        let started = std::time::Instant::now();
        list.stop();
        list.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
