//! `timerfd(2)` wrapper: a file descriptor that becomes readable once at its
//! programmed expiration, the kernel primitive [`crate::timer::TimerQueue`]
//! arms against.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::last_os_error;
use crate::time::Duration;

pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_os_error());
        }
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Arms a one-shot expiration `delay` from now. `delay <= 0` fires almost
    /// immediately rather than disarming (`timerfd_settime` treats an
    /// all-zero `itimerspec` as "disarm", which this crate never wants here).
    pub fn arm(&self, delay: Duration) -> io::Result<()> {
        let micros = delay.as_micros().max(100);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: micros / 1_000_000,
                tv_nsec: (micros % 1_000_000) * 1_000,
            },
        };
        let rc = unsafe { libc::timerfd_settime(self.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// Disarms the timer: no future expiration will fire until re-armed.
    pub fn disarm(&self) -> io::Result<()> {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::timerfd_settime(self.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// Drains the expiration counter. Returns the number of expirations
    /// since the last read (normally 1).
    pub fn read(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            let err = last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("TimerFd::read expected 8 bytes, got {n}: {err}");
            }
        }
        Ok(value)
    }
}
