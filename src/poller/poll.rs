//! `poll(2)` demultiplexer back end.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use crate::channel::{Channel, PollEvents, WeakChannel};
use crate::error::last_os_error;
use crate::time::Timestamp;

pub struct Poller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, (WeakChannel, usize)>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        })
    }

    pub fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> io::Result<Timestamp> {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(now);
            }
            return Err(err);
        }

        for pfd in &self.pollfds {
            if pfd.revents != 0 {
                let fd = if pfd.fd >= 0 { pfd.fd } else { -pfd.fd - 1 };
                if let Some((weak, _)) = self.channels.get(&fd) {
                    if let Some(channel) = weak.upgrade() {
                        channel.set_revents(PollEvents(pfd.revents));
                        active_channels.push(channel);
                    }
                }
            }
        }

        Ok(now)
    }

    pub fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        let events = self.events_for(channel);

        match self.channels.get(&fd).map(|(_, idx)| *idx) {
            None => {
                let idx = self.pollfds.len();
                self.pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                self.channels.insert(fd, (channel.downgrade(), idx));
            }
            Some(idx) => {
                let pfd = &mut self.pollfds[idx];
                pfd.fd = fd;
                pfd.events = events;
                pfd.revents = 0;
                if channel.is_none_event() {
                    pfd.fd = -fd - 1;
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        let Some((_, idx)) = self.channels.remove(&fd) else {
            return;
        };

        let last = self.pollfds.len() - 1;
        if idx == last {
            self.pollfds.pop();
        } else {
            self.pollfds.swap(idx, last);
            self.pollfds.pop();
            let swapped_fd = self.pollfds[idx].fd;
            let swapped_fd = if swapped_fd >= 0 {
                swapped_fd
            } else {
                -swapped_fd - 1
            };
            if let Some(entry) = self.channels.get_mut(&swapped_fd) {
                entry.1 = idx;
            }
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.fd())
    }

    fn events_for(&self, channel: &Channel) -> libc::c_short {
        let mut events = 0;
        if channel.is_reading() {
            events |= libc::POLLIN | libc::POLLPRI;
        }
        if channel.is_writing() {
            events |= libc::POLLOUT;
        }
        events as libc::c_short
    }
}
