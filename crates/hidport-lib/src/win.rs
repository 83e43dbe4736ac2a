//! Win32 plumbing shared by the HID, serial and sync backends.

use std::sync::RwLock;
use std::time::Duration;

use windows::Win32::Foundation::{
    CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Threading::{
    CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForMultipleObjects,
};
use windows::core::PCWSTR;

pub const ERROR_FILE_NOT_FOUND: u32 = 0x80070002;
pub const ERROR_ACCESS_DENIED: u32 = 0x80070005;
pub const ERROR_SHARING_VIOLATION: u32 = 0x80070020;
pub const ERROR_ALREADY_EXISTS: u32 = 0x800700B7;
pub const ERROR_OPERATION_ABORTED: u32 = 0x800703E3;
pub const ERROR_IO_PENDING: u32 = 0x800703E5;
pub const ERROR_DEVICE_NOT_CONNECTED: u32 = 0x8007048F;

pub fn hresult(e: &windows::core::Error) -> u32 {
    e.code().0 as u32
}

/// Null-terminated UTF-16 copy of `s`.
pub fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Closes the wrapped handle on drop.
pub struct Handle(pub HANDLE);

// Kernel handles may be used from any thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_invalid() && self.0 != INVALID_HANDLE_VALUE {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// A device handle closed explicitly, once, when the last reference to the
/// stream goes away. Operations borrow the raw handle through [`with`]
/// and never see it after [`close`].
///
/// [`with`]: HandleSlot::with
/// [`close`]: HandleSlot::close
pub struct HandleSlot(RwLock<Option<Handle>>);

impl HandleSlot {
    pub fn new(handle: Handle) -> Self {
        HandleSlot(RwLock::new(Some(handle)))
    }

    /// Run `f` on the open handle; `None` once closed.
    pub fn with<T>(&self, f: impl FnOnce(HANDLE) -> T) -> Option<T> {
        let slot = self.0.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|h| f(h.raw()))
    }

    /// Close the handle after in-flight `with` calls return. Returns
    /// `false` if it was already closed.
    pub fn close(&self) -> bool {
        let handle = self.0.write().unwrap_or_else(|e| e.into_inner()).take();
        handle.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.0.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// An unnamed manual-reset event.
pub struct ManualEvent(Handle);

impl ManualEvent {
    pub fn new() -> windows::core::Result<Self> {
        let h = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
        Ok(ManualEvent(Handle(h)))
    }

    pub fn set(&self) {
        unsafe {
            let _ = SetEvent(self.0.raw());
        }
    }

    pub fn reset(&self) {
        unsafe {
            let _ = ResetEvent(self.0.raw());
        }
    }

    pub fn raw(&self) -> HANDLE {
        self.0.raw()
    }
}

/// How an overlapped operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Bytes transferred.
    Done(u32),
    TimedOut,
    /// The close event fired first; the operation was cancelled.
    Closed,
}

pub fn wait_millis(timeout: Option<Duration>) -> u32 {
    timeout.map_or(INFINITE, |d| d.as_millis().min((INFINITE - 1) as u128) as u32)
}

/// Issue one overlapped operation on `handle` and wait for it, for `close`
/// or for the timeout, whichever comes first. Unfinished operations are
/// cancelled before returning so the buffer is no longer referenced.
pub fn overlapped(
    handle: HANDLE,
    close: &ManualEvent,
    timeout: Option<Duration>,
    start: impl FnOnce(*mut OVERLAPPED) -> windows::core::Result<()>,
) -> windows::core::Result<Completion> {
    let event = ManualEvent::new()?;
    let mut ov = OVERLAPPED {
        hEvent: event.raw(),
        ..Default::default()
    };
    if let Err(e) = start(&mut ov) {
        if hresult(&e) != ERROR_IO_PENDING {
            return Err(e);
        }
    }

    let wait = unsafe {
        WaitForMultipleObjects(&[event.raw(), close.raw()], false, wait_millis(timeout))
    };
    let mut n: u32 = 0;
    if wait == WAIT_OBJECT_0 {
        unsafe { GetOverlappedResult(handle, &ov, &mut n, false) }?;
        return Ok(Completion::Done(n));
    }

    unsafe {
        let _ = CancelIoEx(handle, Some(&ov));
    }
    // The operation may have completed between the wait and the cancel.
    if unsafe { GetOverlappedResult(handle, &ov, &mut n, true) }.is_ok() {
        return Ok(Completion::Done(n));
    }
    Ok(if wait == WAIT_TIMEOUT {
        Completion::TimedOut
    } else {
        Completion::Closed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_slot_closes_once() {
        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.unwrap();
        let slot = HandleSlot::new(Handle(event));
        assert_eq!(slot.with(|h| h == event), Some(true));
        assert!(slot.close());
        assert!(slot.is_closed());
        assert!(!slot.close());
        assert_eq!(slot.with(|_| ()), None);
    }
}
