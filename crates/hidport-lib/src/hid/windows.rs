//! Windows HID class driver backend.

use std::ffi::c_void;
use std::time::Duration;

use windows::Win32::Devices::HumanInterfaceDevice::{
    HIDP_CAPS, HIDP_STATUS_SUCCESS, HidD_FreePreparsedData, HidD_GetFeature,
    HidD_GetPreparsedData, HidD_SetFeature, HidP_GetCaps, PHIDP_PREPARSED_DATA,
};
use windows::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, ReadFile,
    WriteFile,
};
use windows::core::PCWSTR;

use super::{HidBackend, ReadOutcome};
use crate::descriptor::ReportInfo;
use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};
use crate::win::{self, Completion, Handle, HandleSlot, ManualEvent};

pub struct WindowsHidBackend {
    path: String,
    handle: HandleSlot,
    info: ReportInfo,
    closing: ManualEvent,
}

fn open_handle(path: &str) -> windows::core::Result<HANDLE> {
    let wide = win::wide(path);
    unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            (GENERIC_READ | GENERIC_WRITE).0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            None,
        )
    }
}

pub(crate) fn open_error(path: &str, e: &windows::core::Error) -> HidportError {
    match win::hresult(e) {
        win::ERROR_ACCESS_DENIED => HidportError::UnauthorizedAccess {
            device: path.to_string(),
            message: e.message(),
        },
        win::ERROR_SHARING_VIOLATION => HidportError::in_use(path),
        win::ERROR_FILE_NOT_FOUND | win::ERROR_DEVICE_NOT_CONNECTED => {
            HidportError::NotFound(path.to_string())
        }
        code => {
            let message = format!("CreateFileW: {}", e.message());
            HidportError::Device(
                DeviceIoError::new(IoErrorKind::Native, path, message).with_code(code as i32),
            )
        }
    }
}

fn report_info(handle: HANDLE) -> Option<ReportInfo> {
    let mut preparsed = PHIDP_PREPARSED_DATA::default();
    if !unsafe { HidD_GetPreparsedData(handle, &mut preparsed) } {
        return None;
    }
    let mut caps = HIDP_CAPS::default();
    let status = unsafe { HidP_GetCaps(preparsed, &mut caps) };
    unsafe {
        let _ = HidD_FreePreparsedData(preparsed);
    }
    if status != HIDP_STATUS_SUCCESS {
        return None;
    }
    Some(ReportInfo {
        max_input_len: caps.InputReportByteLength as usize,
        max_output_len: caps.OutputReportByteLength as usize,
        max_feature_len: caps.FeatureReportByteLength as usize,
        // The class driver always supplies the ID byte, numbered or not.
        uses_report_ids: true,
    })
}

impl WindowsHidBackend {
    pub fn open(path: &str) -> Result<Self> {
        let handle = Handle(open_handle(path).map_err(|e| open_error(path, &e))?);
        let info = report_info(handle.raw()).ok_or_else(|| {
            HidportError::Device(DeviceIoError::new(
                IoErrorKind::Native,
                path,
                "HidP_GetCaps failed",
            ))
        })?;
        let closing = ManualEvent::new().map_err(|e| io_error(path, "CreateEventW", &e))?;
        Ok(WindowsHidBackend {
            path: path.to_string(),
            handle: HandleSlot::new(handle),
            info,
            closing,
        })
    }
}

impl WindowsHidBackend {
    fn with_handle<T>(&self, f: impl FnOnce(HANDLE) -> Result<T>) -> Result<T> {
        self.handle.with(f).unwrap_or(Err(HidportError::Closed))
    }
}

fn io_error(path: &str, context: &str, e: &windows::core::Error) -> HidportError {
    let kind = match win::hresult(e) {
        win::ERROR_DEVICE_NOT_CONNECTED => IoErrorKind::Disconnected,
        _ => IoErrorKind::Native,
    };
    HidportError::Device(
        DeviceIoError::new(kind, path, format!("{context}: {}", e.message()))
            .with_code(win::hresult(e) as i32),
    )
}

impl HidBackend for WindowsHidBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn report_info(&self) -> ReportInfo {
        self.info
    }

    /// Blocks until a report arrives or `wake` is called; the poll interval
    /// is not needed because the close event interrupts the wait.
    fn read_report(&self, _poll: Duration) -> Result<ReadOutcome> {
        let mut buf = vec![0u8; self.info.max_input_len.max(1)];
        let Some(done) = self.handle.with(|h| {
            win::overlapped(h, &self.closing, None, |ov| unsafe {
                ReadFile(h, Some(&mut buf), None, Some(ov))
            })
        }) else {
            return Ok(ReadOutcome::Disconnected);
        };
        match done {
            Ok(Completion::Done(0)) => Ok(ReadOutcome::Idle),
            Ok(Completion::Done(n)) => {
                buf.truncate(n as usize);
                Ok(ReadOutcome::Report(buf))
            }
            Ok(Completion::TimedOut | Completion::Closed) => Ok(ReadOutcome::Idle),
            Err(e) => match win::hresult(&e) {
                win::ERROR_DEVICE_NOT_CONNECTED | win::ERROR_OPERATION_ABORTED => {
                    Ok(ReadOutcome::Disconnected)
                }
                _ => Err(io_error(&self.path, "ReadFile", &e)),
            },
        }
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        // The class driver rejects writes shorter than the output report.
        let mut buf = data.to_vec();
        if buf.len() < self.info.max_output_len {
            buf.resize(self.info.max_output_len, 0);
        }
        let done = self.with_handle(|h| {
            win::overlapped(h, &self.closing, None, |ov| unsafe {
                WriteFile(h, Some(&buf), None, Some(ov))
            })
            .map_err(|e| io_error(&self.path, "WriteFile", &e))
        })?;
        match done {
            Completion::Done(_) => Ok(()),
            Completion::TimedOut | Completion::Closed => Err(HidportError::Closed),
        }
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().max(self.info.max_feature_len);
        let mut report = vec![0u8; len];
        report[0] = buf.first().copied().unwrap_or(0);
        let ok = self.with_handle(|h| {
            Ok(unsafe {
                HidD_GetFeature(h, report.as_mut_ptr() as *mut c_void, report.len() as u32)
            })
        })?;
        if !ok {
            let e = std::io::Error::last_os_error();
            return Err(HidportError::Device(DeviceIoError::new(
                IoErrorKind::Feature,
                &self.path,
                format!("HidD_GetFeature: {e}"),
            )));
        }
        let n = buf.len().min(report.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    fn set_feature(&self, data: &[u8]) -> Result<()> {
        let mut report = data.to_vec();
        if report.len() < self.info.max_feature_len {
            report.resize(self.info.max_feature_len, 0);
        }
        let ok = self.with_handle(|h| {
            Ok(unsafe {
                HidD_SetFeature(h, report.as_ptr() as *const c_void, report.len() as u32)
            })
        })?;
        if !ok {
            let e = std::io::Error::last_os_error();
            return Err(HidportError::Device(DeviceIoError::new(
                IoErrorKind::Feature,
                &self.path,
                format!("HidD_SetFeature: {e}"),
            )));
        }
        Ok(())
    }

    fn wake(&self) {
        self.closing.set();
    }

    fn free(&self) {
        // Pending overlapped waits return on `closing`, releasing the slot.
        self.closing.set();
        if self.handle.close() {
            log::debug!("{}: handle closed", self.path);
        }
    }
}
