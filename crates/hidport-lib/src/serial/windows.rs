//! Win32 COM port backend.

use windows::Win32::Devices::Communication::{
    COMMTIMEOUTS, DCB, EVENPARITY, GetCommState, NOPARITY, ODDPARITY, ONESTOPBIT, PURGE_RXCLEAR,
    PURGE_TXCLEAR, PurgeComm, SetCommState, SetCommTimeouts, TWOSTOPBITS,
};
use windows::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_MODE, OPEN_EXISTING, ReadFile, WriteFile,
};
use windows::core::PCWSTR;

use super::{Parity, SerialBackend, SerialSettings, StopBits};
use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};
use crate::hid::windows::open_error;
use crate::stream::Deadline;
use crate::win::{self, Completion, Handle, HandleSlot, ManualEvent};

/// `fBinary`, the only DCB flag we set.
const DCB_BINARY: u32 = 0x1;

/// `\\.\COM10` style path for a port name.
pub fn device_path(port: &str) -> String {
    if port.starts_with(r"\\.\") {
        port.to_string()
    } else {
        format!(r"\\.\{port}")
    }
}

pub struct WindowsSerialBackend {
    path: String,
    handle: HandleSlot,
    closing: ManualEvent,
}

impl WindowsSerialBackend {
    pub fn open(port: &str) -> Result<Self> {
        let path = device_path(port);
        let wide = win::wide(&path);
        let h = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_MODE(0),
                None,
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                None,
            )
        }
        .map_err(|e| open_error(&path, &e))?;
        let handle = Handle(h);

        // Return as soon as any byte is buffered; the overall deadline is
        // enforced by the overlapped wait.
        let timeouts = COMMTIMEOUTS {
            ReadIntervalTimeout: u32::MAX,
            ReadTotalTimeoutMultiplier: u32::MAX,
            ReadTotalTimeoutConstant: u32::MAX - 1,
            WriteTotalTimeoutMultiplier: 0,
            WriteTotalTimeoutConstant: 0,
        };
        unsafe { SetCommTimeouts(handle.raw(), &timeouts) }
            .map_err(|e| win_error(&path, "SetCommTimeouts", &e))?;
        let closing = ManualEvent::new().map_err(|e| win_error(&path, "CreateEventW", &e))?;

        Ok(WindowsSerialBackend {
            path,
            handle: HandleSlot::new(handle),
            closing,
        })
    }

    fn with_handle<T>(&self, f: impl FnOnce(HANDLE) -> Result<T>) -> Result<T> {
        self.handle.with(f).unwrap_or(Err(HidportError::Closed))
    }
}

fn win_error(path: &str, context: &str, e: &windows::core::Error) -> HidportError {
    HidportError::Device(
        DeviceIoError::new(IoErrorKind::Native, path, format!("{context}: {}", e.message()))
            .with_code(win::hresult(e) as i32),
    )
}

impl SerialBackend for WindowsSerialBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn apply(&self, settings: &SerialSettings, discard_buffered: bool) -> Result<()> {
        self.with_handle(|h| self.apply_on(h, settings, discard_buffered))
    }

    fn read(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        self.with_handle(|h| self.read_on(h, buf, deadline))
    }

    fn write(&self, buf: &[u8], deadline: Deadline) -> Result<()> {
        self.with_handle(|h| self.write_on(h, buf, deadline))
    }

    fn wake(&self) {
        self.closing.set();
    }

    fn free(&self) {
        self.closing.set();
        if self.handle.close() {
            log::debug!("{}: handle closed", self.path);
        }
    }
}

impl WindowsSerialBackend {
    fn apply_on(&self, h: HANDLE, settings: &SerialSettings, discard_buffered: bool) -> Result<()> {
        let mut dcb = DCB {
            DCBlength: std::mem::size_of::<DCB>() as u32,
            ..Default::default()
        };
        unsafe { GetCommState(h, &mut dcb) }
            .map_err(|e| win_error(&self.path, "GetCommState", &e))?;
        dcb.BaudRate = settings.baud_rate;
        dcb.ByteSize = settings.data_bits;
        dcb.Parity = match settings.parity {
            Parity::None => NOPARITY,
            Parity::Odd => ODDPARITY,
            Parity::Even => EVENPARITY,
        };
        dcb.StopBits = match settings.stop_bits {
            StopBits::One => ONESTOPBIT,
            StopBits::Two => TWOSTOPBITS,
        };
        dcb._bitfield = DCB_BINARY;
        unsafe { SetCommState(h, &dcb) }
            .map_err(|e| win_error(&self.path, "SetCommState", &e))?;
        if discard_buffered {
            unsafe { PurgeComm(h, PURGE_RXCLEAR | PURGE_TXCLEAR) }
                .map_err(|e| win_error(&self.path, "PurgeComm", &e))?;
        }
        Ok(())
    }

    fn read_on(&self, h: HANDLE, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        loop {
            let done = win::overlapped(h, &self.closing, deadline.remaining(), |ov| unsafe {
                ReadFile(h, Some(&mut *buf), None, Some(ov))
            })
            .map_err(|e| win_error(&self.path, "ReadFile", &e))?;
            match done {
                Completion::Done(0) if !deadline.expired() => continue,
                Completion::Done(0) | Completion::TimedOut => {
                    return Err(HidportError::Timeout("read"));
                }
                Completion::Done(n) => return Ok(n as usize),
                Completion::Closed => return Err(HidportError::Closed),
            }
        }
    }

    fn write_on(&self, h: HANDLE, buf: &[u8], deadline: Deadline) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let rest = &buf[sent..];
            let done = win::overlapped(h, &self.closing, deadline.remaining(), |ov| unsafe {
                WriteFile(h, Some(rest), None, Some(ov))
            })
            .map_err(|e| win_error(&self.path, "WriteFile", &e))?;
            match done {
                Completion::Done(n) => sent += n as usize,
                Completion::TimedOut => return Err(HidportError::Timeout("write")),
                Completion::Closed => return Err(HidportError::Closed),
            }
        }
        Ok(())
    }
}
