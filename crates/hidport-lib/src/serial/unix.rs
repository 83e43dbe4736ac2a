//! termios serial backend (Linux and macOS).

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, SetArg};

use super::{Parity, SerialBackend, SerialSettings, StopBits};
use crate::error::{DeviceIoError, HidportError, IoErrorKind, Result};
use crate::stream::Deadline;

/// Longest single poll, so a close during a blocking call is noticed.
const POLL_SLICE: Duration = Duration::from_secs(1);

fn baud_rate(rate: u32) -> Option<BaudRate> {
    Some(match rate {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        921600 => BaudRate::B921600,
        _ => return None,
    })
}

pub struct UnixSerialBackend {
    path: String,
    file: ManuallyDrop<File>,
    closing: AtomicBool,
    freed: AtomicBool,
}

impl UnixSerialBackend {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK | nix::libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| HidportError::native(path, "open", e))?;
        Ok(UnixSerialBackend {
            path: path.to_string(),
            file: ManuallyDrop::new(file),
            closing: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        })
    }

    fn errno(&self, context: &str, errno: Errno) -> HidportError {
        let message = format!("{context}: {}", errno.desc());
        HidportError::Device(
            DeviceIoError::new(IoErrorKind::Native, &self.path, message).with_code(errno as i32),
        )
    }

    /// Wait for `flags` on the descriptor until the deadline, one slice at a time.
    fn wait_ready(&self, flags: PollFlags, deadline: &Deadline, op: &'static str) -> Result<()> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(HidportError::Closed);
            }
            let slice = deadline.slice(POLL_SLICE);
            let mut fds = [PollFd::new(self.file.as_fd(), flags)];
            let ms = slice.as_millis().min(u16::MAX as u128) as u16;
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) | Err(Errno::EINTR) => {}
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    let failed = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
                    if revents.intersects(failed) {
                        return Err(HidportError::Device(DeviceIoError::new(
                            IoErrorKind::Native,
                            &self.path,
                            format!("poll reported {revents:?}"),
                        )));
                    }
                    if revents.intersects(flags) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(self.errno("poll", e)),
            }
            if deadline.expired() {
                return Err(HidportError::Timeout(op));
            }
        }
    }
}

impl SerialBackend for UnixSerialBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn apply(&self, settings: &SerialSettings, discard_buffered: bool) -> Result<()> {
        let fd = &*self.file;
        let mut t = termios::tcgetattr(fd).map_err(|e| self.errno("tcgetattr", e))?;
        termios::cfmakeraw(&mut t);

        let rate = baud_rate(settings.baud_rate).ok_or_else(|| {
            HidportError::InvalidOperation(format!("unsupported baud rate {}", settings.baud_rate))
        })?;
        termios::cfsetspeed(&mut t, rate).map_err(|e| self.errno("cfsetspeed", e))?;

        let mut cflags = t.control_flags;
        cflags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
        cflags.remove(ControlFlags::PARODD | ControlFlags::CSTOPB);
        cflags.insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
        cflags.insert(if settings.data_bits == 7 {
            ControlFlags::CS7
        } else {
            ControlFlags::CS8
        });
        match settings.parity {
            Parity::None => {}
            Parity::Odd => cflags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
            Parity::Even => cflags.insert(ControlFlags::PARENB),
        }
        if settings.stop_bits == StopBits::Two {
            cflags.insert(ControlFlags::CSTOPB);
        }
        t.control_flags = cflags;

        termios::tcsetattr(fd, SetArg::TCSANOW, &t).map_err(|e| self.errno("tcsetattr", e))?;
        if discard_buffered {
            termios::tcflush(fd, FlushArg::TCIOFLUSH).map_err(|e| self.errno("tcflush", e))?;
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        loop {
            self.wait_ready(PollFlags::POLLIN, &deadline, "read")?;
            match (&*self.file).read(buf) {
                Ok(0) => {
                    if deadline.expired() {
                        return Err(HidportError::Timeout("read"));
                    }
                }
                Ok(n) => return Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(HidportError::native(&self.path, "read", e)),
            }
        }
    }

    fn write(&self, buf: &[u8], deadline: Deadline) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match (&*self.file).write(&buf[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.wait_ready(PollFlags::POLLOUT, &deadline, "write")?;
                }
                Err(e) => return Err(HidportError::native(&self.path, "write", e)),
            }
        }
        Ok(())
    }

    fn wake(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn free(&self) {
        if !self.freed.swap(true, Ordering::SeqCst) {
            if let Err(e) = nix::unistd::close(self.file.as_raw_fd()) {
                log::debug!("{}: close failed: {e}", self.path);
            }
        }
    }
}

impl Drop for UnixSerialBackend {
    fn drop(&mut self) {
        if !*self.freed.get_mut() {
            // SAFETY: never closed through `free` and not used past this point.
            unsafe { ManuallyDrop::drop(&mut self.file) };
        }
    }
}
