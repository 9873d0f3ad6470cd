//! Connects to a remote address on behalf of `TcpClient`, retrying with
//! exponential backoff on transient failures.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::error::last_os_error;
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::time::Duration;

const INIT_RETRY_DELAY: Duration = Duration::from_micros(500_000);
const MAX_RETRY_DELAY: Duration = Duration::from_micros(30_000_000);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Status {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectedCallback = Box<dyn FnMut(OwnedFd)>;

pub struct Connector {
    self_weak: Weak<Connector>,
    event_loop: EventLoop,
    server_addr: Endpoint,
    status: Cell<Status>,
    is_connect: AtomicBool,
    retry_delay: Cell<Duration>,
    channel: RefCell<Option<Channel>>,
    connection_callback: RefCell<Option<ConnectedCallback>>,
}

impl Connector {
    pub fn new(event_loop: &EventLoop, server_addr: Endpoint) -> Rc<Connector> {
        Rc::new_cyclic(|weak_self| Connector {
            self_weak: weak_self.clone(),
            event_loop: event_loop.clone(),
            server_addr,
            status: Cell::new(Status::Disconnected),
            is_connect: AtomicBool::new(false),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            channel: RefCell::new(None),
            connection_callback: RefCell::new(None),
        })
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(OwnedFd) + 'static) {
        *self.connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn server_address(&self) -> Endpoint {
        self.server_addr
    }

    /// Safe to call from any thread.
    pub fn start(self: &Rc<Self>) {
        self.is_connect.store(true, Ordering::SeqCst);
        let this = self.clone();
        self.event_loop.run_in_loop(move || this.start_in_loop());
    }

    /// Safe to call from any thread.
    pub fn stop(self: &Rc<Self>) {
        self.is_connect.store(false, Ordering::SeqCst);
        let this = self.clone();
        self.event_loop.queue_in_loop(move || this.stop_in_loop());
    }

    /// Must be called from the loop thread.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.status.set(Status::Disconnected);
        self.retry_delay.set(INIT_RETRY_DELAY);
        self.is_connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.status.get(), Status::Disconnected);
        if self.is_connect.load(Ordering::SeqCst) {
            self.connect();
        } else {
            log::debug!("Connector::start_in_loop - do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.status.get() == Status::Connecting {
            self.status.set(Status::Disconnected);
            let fd = self.remove_and_reset_channel();
            self.retry(fd);
        }
    }

    fn connect(&self) {
        let addr = self.server_addr.as_socket_addr();
        let socket = match Socket::new(addr) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Connector::connect could not create socket: {e}");
                return;
            }
        };

        match socket.connect(addr) {
            Ok(()) => self.connecting(socket.into_raw_fd()),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket.into_raw_fd());
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => {
                    self.retry(socket.into_raw_fd());
                }
                _ => {
                    log::error!("Connector::connect error: {e}");
                    // `socket` drops here, closing the descriptor.
                }
            },
        }
    }

    fn connecting(&self, raw: RawFd) {
        self.status.set(Status::Connecting);
        assert!(self.channel.borrow().is_none());
        let channel = Channel::new(&self.event_loop, raw);

        let weak = self.self_weak.clone();
        channel.set_write_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_write();
            }
        });
        let weak = self.self_weak.clone();
        channel.set_error_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_error();
            }
        });
        channel.enable_write();

        *self.channel.borrow_mut() = Some(channel);
    }

    fn handle_write(&self) {
        log::trace!("Connector::handle_write status = {:?}", self.status.get());
        if self.status.get() != Status::Connecting {
            log::debug!("Connector::handle_write - status is not Connecting");
            return;
        }

        let fd = self.remove_and_reset_channel();
        match socket_error(fd) {
            Ok(Some(err)) => {
                log::warn!("SO_ERROR = {err}");
                self.retry(fd);
            }
            Ok(None) => {
                self.status.set(Status::Connected);
                if self.is_connect.load(Ordering::SeqCst) {
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
                        cb(owned);
                    } else {
                        drop(owned);
                    }
                } else {
                    log::debug!("Connector::handle_write - is_connect is false");
                    unsafe { libc::close(fd) };
                }
            }
            Err(e) => {
                log::warn!("Connector::handle_write could not read SO_ERROR: {e}");
                self.retry(fd);
            }
        }
    }

    fn handle_error(&self) {
        log::error!("Connector::handle_error status = {:?}", self.status.get());
        if self.status.get() == Status::Connecting {
            let fd = self.remove_and_reset_channel();
            if let Ok(Some(err)) = socket_error(fd) {
                log::trace!("SO_ERROR {err}");
            }
            self.retry(fd);
        }
    }

    fn retry(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
        self.status.set(Status::Disconnected);
        if self.is_connect.load(Ordering::SeqCst) {
            let delay = self.retry_delay.get();
            log::info!(
                "Retry connect to {} in {} ms",
                self.server_addr,
                delay.as_micros() / 1000
            );
            let weak = self.self_weak.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(this) = weak.upgrade() {
                    this.start_in_loop();
                }
            });
            self.retry_delay.set(std::cmp::min(delay * 2, MAX_RETRY_DELAY));
        } else {
            log::debug!("Connector::retry - do not connect");
        }
    }

    /// Detaches the in-flight channel, returning its fd, and schedules the
    /// `Channel` itself to be dropped on the next loop iteration (it must
    /// outlive the callback that is currently invoking this).
    fn remove_and_reset_channel(&self) -> RawFd {
        let channel = self.channel.borrow().clone().expect("channel present while connecting");
        channel.disable_all();
        channel.remove();
        let fd = channel.fd();

        let weak = self.self_weak.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(this) = weak.upgrade() {
                *this.channel.borrow_mut() = None;
            }
        });

        fd
    }
}

fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(if value == 0 {
        None
    } else {
        Some(io::Error::from_raw_os_error(value))
    })
}
