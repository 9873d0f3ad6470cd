//! `eventfd(2)` wrapper used for both the loop's cross-thread wakeup channel
//! and (indirectly) as the kernel primitive backing the timer descriptor's
//! readiness notification model.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::last_os_error;

/// A kernel counter descriptor: writes add to the counter and wake a reader
/// blocked in `poll`/`epoll_wait`; reads drain it back to zero.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_os_error());
        }
        Ok(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Adds 1 to the counter, waking any blocked reader.
    pub fn write_one(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            log::error!("EventFd::write_one wrote {n} bytes, expected 8");
        }
        Ok(())
    }

    /// Drains the counter back to zero, returning its prior value.
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
                log::warn!("EventFd::read expected 8 bytes, got {n}: {err}");
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_the_counter() {
        let efd = EventFd::new().unwrap();
        efd.write_one().unwrap();
        efd.write_one().unwrap();
        let value = efd.read().unwrap();
        assert_eq!(value, 2);
    }
}
