//! Binds one file descriptor to its interest mask and per-event callbacks,
//! with a weak tie to whatever logical object owns it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Weak as ArcWeak};

use crate::event_loop::EventLoop;
use crate::time::Timestamp;

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type PlainCallback = Box<dyn FnMut()>;

struct ChannelInner {
    event_loop: EventLoop,
    fd: RawFd,
    reading: Cell<bool>,
    writing: Cell<bool>,
    revents: Cell<PollEvents>,
    log_hup: Cell<bool>,
    tie: RefCell<Option<ArcWeak<dyn Any + Send + Sync>>>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<PlainCallback>>,
    close_callback: RefCell<Option<PlainCallback>>,
    error_callback: RefCell<Option<PlainCallback>>,
}

/// The readiness mask the demultiplexer reports back for one channel,
/// expressed in `poll(2)` terms regardless of which back end produced it.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct PollEvents(pub i16);

impl PollEvents {
    pub const NONE: PollEvents = PollEvents(0);

    pub fn contains_any(self, mask: i16) -> bool {
        (self.0 & mask) != 0
    }
}

/// A file descriptor's interest mask + callbacks, registered with exactly
/// one [`EventLoop`]'s demultiplexer. Cheap to clone (an `Rc` handle); the
/// loop's own registry holds only a [`Weak`] counterpart.
#[derive(Clone)]
pub struct Channel(Rc<ChannelInner>);

impl Channel {
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Channel {
        Channel(Rc::new(ChannelInner {
            event_loop: event_loop.clone(),
            fd,
            reading: Cell::new(false),
            writing: Cell::new(false),
            revents: Cell::new(PollEvents::NONE),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.0.fd
    }

    pub fn is_reading(&self) -> bool {
        self.0.reading.get()
    }

    pub fn is_writing(&self) -> bool {
        self.0.writing.get()
    }

    pub fn is_none_event(&self) -> bool {
        !self.is_reading() && !self.is_writing()
    }

    pub fn enable_read(&self) {
        self.0.reading.set(true);
        self.update();
    }

    pub fn disable_read(&self) {
        self.0.reading.set(false);
        self.update();
    }

    pub fn enable_write(&self) {
        self.0.writing.set(true);
        self.update();
    }

    pub fn disable_write(&self) {
        self.0.writing.set(false);
        self.update();
    }

    pub fn disable_all(&self) {
        self.0.reading.set(false);
        self.0.writing.set(false);
        self.update();
    }

    pub fn set_not_log_hup(&self) {
        self.0.log_hup.set(false);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.0.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.0.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.0.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.0.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties this channel's dispatch to `owner`'s lifetime: before invoking a
    /// callback the loop upgrades the weak reference, skipping the event
    /// entirely if the owner is already gone.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.0.tie.borrow_mut() = Some(Arc::downgrade(owner));
    }

    pub(crate) fn set_revents(&self, revents: PollEvents) {
        self.0.revents.set(revents);
    }

    fn update(&self) {
        self.0.event_loop.update_channel(self);
    }

    /// Detaches from the loop; requires `is_none_event()`. Does not close the fd.
    pub fn remove(&self) {
        assert!(self.is_none_event(), "channel must clear interest before removal");
        self.0.event_loop.remove_channel(self);
    }

    /// Dispatches the last-recorded readiness mask, in the fixed order the
    /// demultiplexer contract specifies. `received_at` stamps the read callback.
    pub fn handle_event(&self, received_at: Timestamp) {
        let guard = self.0.tie.borrow().as_ref().map(ArcWeak::upgrade);
        match guard {
            Some(None) => return, // tied owner already destroyed, skip.
            Some(Some(strong)) => {
                self.handle_event_inner(received_at);
                drop(strong);
            }
            None => self.handle_event_inner(received_at),
        }
    }

    fn handle_event_inner(&self, received_at: Timestamp) {
        let revents = self.0.revents.get();

        if revents.contains_any(libc::POLLHUP as i16) && !revents.contains_any(libc::POLLIN as i16)
        {
            if self.0.log_hup.get() {
                log::warn!("Channel::handle_event fd = {} POLLHUP", self.0.fd);
            }
            if let Some(cb) = self.0.close_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if revents.contains_any(libc::POLLNVAL as i16) {
            log::warn!("Channel::handle_event fd = {} POLLNVAL", self.0.fd);
        }

        if revents.contains_any((libc::POLLERR | libc::POLLNVAL) as i16) {
            if let Some(cb) = self.0.error_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if revents.contains_any((libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as i16) {
            if let Some(cb) = self.0.read_callback.borrow_mut().as_mut() {
                cb(received_at);
            }
        }

        if revents.contains_any(libc::POLLOUT as i16) {
            if let Some(cb) = self.0.write_callback.borrow_mut().as_mut() {
                cb();
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.0.fd)
            .field("reading", &self.is_reading())
            .field("writing", &self.is_writing())
            .finish()
    }
}

impl Eq for Channel {}
impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A weak handle to a [`Channel`], the form the demultiplexer's own fd
/// registry holds so it never keeps a removed channel alive.
#[derive(Clone)]
pub struct WeakChannel(Weak<ChannelInner>);

impl Channel {
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Rc::downgrade(&self.0))
    }
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(Channel)
    }
}
