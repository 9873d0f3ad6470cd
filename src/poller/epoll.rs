//! `epoll(7)` demultiplexer back end.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::channel::{Channel, PollEvents, WeakChannel};
use crate::error::last_os_error;
use crate::time::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 32;

#[derive(Copy, Clone, Eq, PartialEq)]
enum Index {
    New,
    Added,
    Deleted,
}

pub struct Epoller {
    epoll_fd: OwnedFd,
    channels: HashMap<RawFd, (WeakChannel, Index)>,
    events: Vec<libc::epoll_event>,
}

impl Epoller {
    pub fn new() -> io::Result<Epoller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(last_os_error());
        }
        Ok(Epoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            channels: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
        })
    }

    pub fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> io::Result<Timestamp> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
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

        if n as usize == self.events.len() {
            self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
        }

        for ev in &self.events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if let Some((weak, _)) = self.channels.get(&fd) {
                if let Some(channel) = weak.upgrade() {
                    channel.set_revents(PollEvents(ev.events as i16));
                    active_channels.push(channel);
                }
            }
        }

        Ok(now)
    }

    pub fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        let index = self.channels.get(&fd).map(|(_, idx)| *idx).unwrap_or(Index::New);

        match index {
            Index::New | Index::Deleted => {
                self.channels
                    .insert(fd, (channel.downgrade(), Index::Added));
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Index::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    if let Some(entry) = self.channels.get_mut(&fd) {
                        entry.1 = Index::Deleted;
                    }
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        if let Some((_, index)) = self.channels.remove(&fd) {
            if index == Index::Added {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
            }
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.fd())
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut events: u32 = libc::EPOLLET as u32;
        if channel.is_reading() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32;
        }
        if channel.is_writing() {
            events |= libc::EPOLLOUT as u32;
        }
        // Level-triggered parity with the poll back end: never set EPOLLET.
        events &= !(libc::EPOLLET as u32);

        let mut event = libc::epoll_event {
            events,
            u64: channel.fd() as u64,
        };

        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event)
        };
        if rc < 0 {
            let err = last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                log::error!("epoll_ctl DEL fd = {} error: {err}", channel.fd());
            } else {
                panic!("epoll_ctl op = {op} fd = {} error: {err}", channel.fd());
            }
        }
    }
}
