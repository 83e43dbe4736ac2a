//! Native named kernel events and mutexes.
//!
//! Objects live in the `Global\` namespace when the process may create
//! them there and fall back to `Local\` otherwise. Kernel mutexes are owned
//! by the locking thread: `try_lock` and `unlock` must run on one thread.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use windows::Win32::Foundation::{HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, OpenMutexW, ReleaseMutex, ResetEvent, SYNCHRONIZATION_SYNCHRONIZE,
    SetEvent, WaitForMultipleObjects, WaitForSingleObject,
};
use windows::core::PCWSTR;

use super::{Kind, LockRegistry, Waitable, resource_key};
use crate::error::{HidportError, Result};
use crate::win::{self, Handle, ManualEvent};

pub struct Namespace {
    prefix: String,
    pub(crate) locks: LockRegistry,
}

fn win_error(context: &str, e: &windows::core::Error) -> HidportError {
    HidportError::Io(std::io::Error::other(format!("{context}: {}", e.message())))
}

impl Namespace {
    pub fn start(dir: PathBuf, prefix: &str) -> Result<Arc<Self>> {
        log::trace!("kernel objects ignore the namespace dir {}", dir.display());
        let prefix: String = prefix
            .chars()
            .map(|c| if c == '\\' || c == '/' { '_' } else { c })
            .collect();
        Ok(Arc::new(Namespace {
            prefix: prefix.trim_matches('_').to_string(),
            locks: LockRegistry::default(),
        }))
    }

    pub fn shutdown(&self) {}

    fn object_name(&self, scope: &str, kind: Kind, name: &str) -> Vec<u16> {
        win::wide(&format!(
            "{scope}\\{}-{}-{}",
            self.prefix,
            kind.as_str(),
            resource_key(kind, name)
        ))
    }

    /// Create in `Global\`, falling back to `Local\` without the privilege.
    fn create(
        &self,
        kind: Kind,
        name: &str,
        make: impl Fn(PCWSTR) -> windows::core::Result<HANDLE>,
    ) -> Result<Handle> {
        let global = self.object_name("Global", kind, name);
        match make(PCWSTR(global.as_ptr())) {
            Ok(h) => Ok(Handle(h)),
            Err(e) if win::hresult(&e) == win::ERROR_ACCESS_DENIED => {
                let local = self.object_name("Local", kind, name);
                make(PCWSTR(local.as_ptr()))
                    .map(Handle)
                    .map_err(|e| win_error("create named object", &e))
            }
            Err(e) => Err(win_error("create named object", &e)),
        }
    }

    pub fn mutex_may_exist(&self, name: &str) -> bool {
        ["Global", "Local"].iter().any(|scope| {
            let wide = self.object_name(scope, Kind::Mutex, name);
            match unsafe { OpenMutexW(SYNCHRONIZATION_SYNCHRONIZE, false, PCWSTR(wide.as_ptr())) } {
                Ok(h) => {
                    drop(Handle(h));
                    true
                }
                Err(_) => false,
            }
        })
    }

    pub fn wait_any(
        &self,
        items: &[Waitable<'_>],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        let handles: Vec<HANDLE> = items
            .iter()
            .map(|w| match w {
                Waitable::Local(e) => e.event.raw(),
                Waitable::Named(e) => e.handle.raw(),
            })
            .collect();
        let wait = unsafe { WaitForMultipleObjects(&handles, false, win::wait_millis(timeout)) };
        if wait == WAIT_TIMEOUT {
            return Ok(None);
        }
        let index = wait.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        if index < handles.len() {
            return Ok(Some(index));
        }
        Err(HidportError::Io(std::io::Error::last_os_error()))
    }
}

/// A named, manual-reset, cross-process event.
pub struct NamedEvent {
    name: String,
    handle: Handle,
}

impl NamedEvent {
    pub(crate) fn create(ns: &Arc<Namespace>, name: &str) -> Result<Self> {
        let handle =
            ns.create(Kind::Event, name, |n| unsafe { CreateEventW(None, true, false, n) })?;
        Ok(NamedEvent {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> Result<()> {
        unsafe { SetEvent(self.handle.raw()) }.map_err(|e| win_error("SetEvent", &e))
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { ResetEvent(self.handle.raw()) }.map_err(|e| win_error("ResetEvent", &e))
    }

    pub fn is_set(&self) -> Result<bool> {
        Ok(unsafe { WaitForSingleObject(self.handle.raw(), 0) } == WAIT_OBJECT_0)
    }
}

/// A named, cross-process, non-recursive mutex.
pub struct NamedMutex {
    ns: Arc<Namespace>,
    name: String,
    handle: Handle,
    held: Mutex<bool>,
}

impl NamedMutex {
    pub(crate) fn create(ns: &Arc<Namespace>, name: &str) -> Result<Self> {
        let handle = ns.create(Kind::Mutex, name, |n| unsafe { CreateMutexW(None, false, n) })?;
        Ok(NamedMutex {
            ns: Arc::clone(ns),
            name: name.to_string(),
            handle,
            held: Mutex::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_locked_by_me(&self) -> bool {
        *self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_lock(&self, timeout: Duration) -> Result<bool> {
        if self.is_locked_by_me() {
            return Err(HidportError::InvalidOperation(format!(
                "mutex '{}' is already locked by this handle",
                self.name
            )));
        }
        // The registry keeps a second caller out while the kernel wait runs.
        self.ns.locks.reserve(&self.name)?;
        let millis = win::wait_millis(Some(timeout));
        let wait = unsafe { WaitForSingleObject(self.handle.raw(), millis) };
        if wait == WAIT_OBJECT_0 || wait == WAIT_ABANDONED {
            if wait == WAIT_ABANDONED {
                log::debug!("mutex '{}': previous owner exited while holding it", self.name);
            }
            *self.held.lock().unwrap_or_else(|e| e.into_inner()) = true;
            return Ok(true);
        }
        self.ns.locks.release(&self.name);
        if wait == WAIT_TIMEOUT {
            return Ok(false);
        }
        let err = std::io::Error::last_os_error();
        Err(HidportError::native(&self.name, "WaitForSingleObject", err))
    }

    pub fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !*held {
            return Err(HidportError::InvalidOperation(format!(
                "mutex '{}' is not locked by this handle",
                self.name
            )));
        }
        *held = false;
        self.ns.locks.release(&self.name);
        unsafe { ReleaseMutex(self.handle.raw()) }.map_err(|e| win_error("ReleaseMutex", &e))
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        if self.is_locked_by_me()
            && let Err(e) = self.unlock()
        {
            log::debug!("mutex '{}': unlock on drop failed: {e}", self.name);
        }
    }
}

/// Process-local manual-reset event.
pub struct LocalEvent {
    event: ManualEvent,
}

impl LocalEvent {
    pub(crate) fn new(_ns: &Arc<Namespace>) -> Result<Self> {
        let event = ManualEvent::new().map_err(|e| win_error("CreateEventW", &e))?;
        Ok(LocalEvent { event })
    }

    pub fn set(&self) {
        self.event.set();
    }

    pub fn reset(&self) {
        self.event.reset();
    }

    pub fn is_set(&self) -> bool {
        unsafe { WaitForSingleObject(self.event.raw(), 0) } == WAIT_OBJECT_0
    }
}
