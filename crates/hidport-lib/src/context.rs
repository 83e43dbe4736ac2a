//! Process-wide library context.
//!
//! Owns the named-primitive namespace that exclusive opens coordinate
//! through, the loaded [`Settings`], and (once asked for) the polled device
//! list. Independent contexts over one namespace behave like separate
//! processes, which is how the tests exercise cross-process behavior.

use std::sync::{Arc, Mutex};

use crate::config::{OpenConfiguration, Settings};
use crate::device::{HidDeviceInfo, SerialDeviceInfo};
use crate::error::{HidportError, Result};
use crate::hid::HidStream;
use crate::list::{DeviceList, DeviceSource};
use crate::platform::Platform;
use crate::serial::SerialStream;
use crate::stream::DeviceStream;
use crate::sync::{self, DEFAULT_SHM_PREFIX, SystemEvents};

pub struct Context {
    settings: Settings,
    events: SystemEvents,
    platform: Platform,
    list: Mutex<Option<Arc<DeviceList>>>,
}

impl Context {
    /// Validate `settings` and start the named-primitive layer.
    pub fn init(settings: Settings) -> Result<Self> {
        if let Err(errors) = settings.validate() {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(HidportError::Config(joined.join("; ")));
        }
        let dir = settings.sync_dir().unwrap_or_else(sync::default_dir);
        let events = SystemEvents::with_namespace(dir, DEFAULT_SHM_PREFIX)?;
        log::debug!("context started on {}", Platform::current());
        Ok(Self::with_events(settings, events))
    }

    /// A context over an already started namespace.
    pub fn with_events(settings: Settings, events: SystemEvents) -> Self {
        Context {
            settings,
            events,
            platform: Platform::current(),
            list: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &SystemEvents {
        &self.events
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The platform device list, started on first use.
    pub fn device_list(&self) -> Result<Arc<DeviceList>> {
        let mut slot = self.list.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = slot.as_ref() {
            return Ok(Arc::clone(list));
        }
        let list = Arc::new(DeviceList::start(
            Box::new(self.platform),
            self.settings.poll_interval(),
        )?);
        *slot = Some(Arc::clone(&list));
        Ok(list)
    }

    /// Replace the device list with one polling `source`.
    pub fn start_device_list(&self, source: Box<dyn DeviceSource>) -> Result<Arc<DeviceList>> {
        let list = Arc::new(DeviceList::start(source, self.settings.poll_interval())?);
        let old = self
            .list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::clone(&list));
        if let Some(old) = old {
            old.stop();
        }
        Ok(list)
    }

    /// Open a HID device by path without enumerating first.
    pub fn open_hid_path(&self, path: &str, config: &OpenConfiguration) -> Result<HidStream> {
        HidDeviceInfo::from_path(path).open(self, config)
    }

    pub fn open_serial_path(&self, path: &str, config: &OpenConfiguration) -> Result<SerialStream> {
        SerialDeviceInfo::from_path(path).open(self, config)
    }

    /// Stream timeouts from the settings file.
    pub(crate) fn apply_default_timeouts(&self, stream: &dyn DeviceStream) {
        stream.set_read_timeout(self.settings.read_timeout());
        stream.set_write_timeout(self.settings.write_timeout());
    }

    /// Stop the device list and the named-primitive background threads.
    /// Streams already open keep working.
    pub fn shutdown(&self) {
        let list = self.list.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(list) = list {
            list.stop();
        }
        self.events.shutdown();
        log::debug!("context shut down");
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dir: &std::path::Path) -> Self {
        let prefix = format!("/c{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
        let events = SystemEvents::with_namespace(dir, &prefix).expect("namespace");
        Self::with_events(Settings::default(), events)
    }
}
