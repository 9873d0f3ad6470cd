//! The I/O demultiplexer: translates [`Channel`] interest masks into kernel
//! waits, with interchangeable `poll(2)` and `epoll(7)` back ends that are
//! observationally equivalent for single-shot level-triggered interest.

mod epoll;
mod poll;

use std::io;

use crate::channel::Channel;
use crate::time::Timestamp;

/// Blocking timeout passed to the kernel wait when no timer is pending sooner.
pub const MAX_POLL_TIMEOUT_MS: i32 = 10_000;

enum Backend {
    Epoll(epoll::Epoller),
    Poll(poll::Poller),
}

/// A narrow, backend-agnostic I/O multiplexer.
pub struct Demultiplexer {
    backend: Backend,
}

impl Demultiplexer {
    pub fn new(use_epoll: bool) -> io::Result<Demultiplexer> {
        let backend = if use_epoll {
            Backend::Epoll(epoll::Epoller::new()?)
        } else {
            Backend::Poll(poll::Poller::new()?)
        };
        Ok(Demultiplexer { backend })
    }

    /// Blocks up to `timeout_ms`, filling `active_channels` with ready channels
    /// and returning the wall-clock timestamp sampled right after the wait
    /// returns. `EINTR` is swallowed silently.
    pub fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> io::Result<Timestamp> {
        active_channels.clear();
        match &mut self.backend {
            Backend::Epoll(e) => e.poll(timeout_ms, active_channels),
            Backend::Poll(p) => p.poll(timeout_ms, active_channels),
        }
    }

    /// Idempotent reconcile of kernel interest for `channel`.
    pub fn update_channel(&mut self, channel: &Channel) {
        match &mut self.backend {
            Backend::Epoll(e) => e.update_channel(channel),
            Backend::Poll(p) => p.update_channel(channel),
        }
    }

    /// Must be preceded by the channel clearing its interest mask.
    pub fn remove_channel(&mut self, channel: &Channel) {
        debug_assert!(channel.is_none_event());
        match &mut self.backend {
            Backend::Epoll(e) => e.remove_channel(channel),
            Backend::Poll(p) => p.remove_channel(channel),
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        match &self.backend {
            Backend::Epoll(e) => e.has_channel(channel),
            Backend::Poll(p) => p.has_channel(channel),
        }
    }
}
