//! Linux hidraw backend.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use super::{HidBackend, ReadOutcome};
use crate::descriptor::ReportInfo;
use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};

const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

/// Fallback read buffer when the descriptor reports no input reports.
const DEFAULT_READ_BUFFER: usize = 4096;

/// Slice used while waiting for the descriptor to become writable.
const WRITE_POLL_SLICE: Duration = Duration::from_millis(100);

#[repr(C)]
pub struct RawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

mod ioctl {
    use super::RawReportDescriptor;

    nix::ioctl_read!(report_descriptor_size, b'H', 0x01, nix::libc::c_int);
    nix::ioctl_read!(report_descriptor, b'H', 0x02, RawReportDescriptor);
    nix::ioctl_readwrite_buf!(set_feature, b'H', 0x06, u8);
    nix::ioctl_readwrite_buf!(get_feature, b'H', 0x07, u8);
}

fn poll_timeout(d: Duration) -> PollTimeout {
    PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16)
}

pub struct LinuxHidBackend {
    path: String,
    file: ManuallyDrop<File>,
    info: ReportInfo,
    closing: AtomicBool,
    freed: AtomicBool,
}

impl LinuxHidBackend {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| HidportError::native(path, "open", e))?;

        let descriptor = read_report_descriptor(&file)
            .map_err(|e| HidportError::native(path, "HIDIOCGRDESC", e.into()))?;
        let info = ReportInfo::parse(&descriptor);

        Ok(LinuxHidBackend {
            path: path.to_string(),
            file: ManuallyDrop::new(file),
            info,
            closing: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        })
    }

    fn device_error(&self, kind: IoErrorKind, context: &str, errno: Errno) -> HidportError {
        HidportError::Device(
            DeviceIoError::new(kind, &self.path, format!("{context}: {}", errno.desc()))
                .with_code(errno as i32),
        )
    }

    fn read_buffer_len(&self) -> usize {
        match self.info.max_input_len {
            0 => DEFAULT_READ_BUFFER,
            n => n,
        }
    }
}

fn read_report_descriptor(file: &File) -> std::result::Result<Vec<u8>, Errno> {
    let fd = file.as_raw_fd();
    let mut size: nix::libc::c_int = 0;
    // SAFETY: fd is an open hidraw descriptor; `size` outlives the call.
    unsafe { ioctl::report_descriptor_size(fd, &mut size) }?;
    let mut raw = Box::new(RawReportDescriptor {
        size: size.clamp(0, HID_MAX_DESCRIPTOR_SIZE as i32) as u32,
        value: [0; HID_MAX_DESCRIPTOR_SIZE],
    });
    // SAFETY: `raw` is a properly sized hidraw_report_descriptor.
    unsafe { ioctl::report_descriptor(fd, &mut *raw) }?;
    Ok(raw.value[..raw.size as usize].to_vec())
}

impl HidBackend for LinuxHidBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn report_info(&self) -> ReportInfo {
        self.info
    }

    fn read_report(&self, poll_for: Duration) -> Result<ReadOutcome> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(poll_for)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(ReadOutcome::Idle),
            Ok(_) => {}
            Err(e) => return Err(self.device_error(IoErrorKind::Native, "poll", e)),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            return Ok(ReadOutcome::Disconnected);
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Ok(ReadOutcome::Idle);
        }

        // Reports from devices without report IDs arrive without the ID
        // byte; leave room for the 0 we put in front.
        let offset = usize::from(!self.info.uses_report_ids);
        let mut buf = vec![0u8; self.read_buffer_len() + offset];
        match (&*self.file).read(&mut buf[offset..]) {
            Ok(0) => Ok(ReadOutcome::Idle),
            Ok(n) => {
                buf.truncate(offset + n);
                Ok(ReadOutcome::Report(buf))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => Err(HidportError::native(&self.path, "read", e)),
        }
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        // hidraw wants the report-ID byte on write() even for devices that
        // do not number their reports (it strips a leading 0 itself), so the
        // buffer goes out unchanged. Reads are the other way around.
        loop {
            match (&*self.file).write(data) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.closing.load(Ordering::SeqCst) {
                        return Err(HidportError::Closed);
                    }
                    let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
                    match poll(&mut fds, poll_timeout(WRITE_POLL_SLICE)) {
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(e) => return Err(self.device_error(IoErrorKind::Native, "poll", e)),
                    }
                }
                Err(e) => return Err(HidportError::native(&self.path, "write", e)),
            }
        }
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: the ioctl reads and writes at most buf.len() bytes.
        let n = unsafe { ioctl::get_feature(self.file.as_raw_fd(), buf) }
            .map_err(|e| self.device_error(IoErrorKind::Feature, "HIDIOCGFEATURE", e))?;
        Ok(n.max(0) as usize)
    }

    fn set_feature(&self, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        // SAFETY: the ioctl reads at most buf.len() bytes.
        unsafe { ioctl::set_feature(self.file.as_raw_fd(), &mut buf) }
            .map_err(|e| self.device_error(IoErrorKind::Feature, "HIDIOCSFEATURE", e))?;
        Ok(())
    }

    fn wake(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn free(&self) {
        if !self.freed.swap(true, Ordering::SeqCst) {
            let fd = self.file.as_raw_fd();
            if let Err(e) = nix::unistd::close(fd) {
                log::debug!("{}: close failed: {e}", self.path);
            }
        }
    }
}

impl Drop for LinuxHidBackend {
    fn drop(&mut self) {
        if !*self.freed.get_mut() {
            // SAFETY: the descriptor was never closed through `free`, and the
            // file is not used after this point.
            unsafe { ManuallyDrop::drop(&mut self.file) };
        }
    }
}
