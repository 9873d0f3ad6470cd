//! A single established TCP connection: owns the socket, the input/output
//! buffers, and the state machine that drives half-close and force-close.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::time::{Duration, Timestamp};

use super::callback::{default_connection_callback, default_message_callback};
use super::callback::{ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};

const DEFAULT_HIGH_WATER_MARK: usize = 60 * 1024 * 1024;

fn call_connection_cb(cb: &ConnectionCallback, conn: &Arc<TcpConnection>) {
    (&mut *cb.lock().unwrap())(conn);
}

fn call_message_cb(cb: &MessageCallback, conn: &Arc<TcpConnection>, buf: &mut Buffer, received_at: Timestamp) {
    (&mut *cb.lock().unwrap())(conn, buf, received_at);
}

fn call_write_complete_cb(cb: &WriteCompleteCallback, conn: &Arc<TcpConnection>) {
    (&mut *cb.lock().unwrap())(conn);
}

fn call_high_water_mark_cb(cb: &HighWaterMarkCallback, conn: &Arc<TcpConnection>, len: usize) {
    (&mut *cb.lock().unwrap())(conn, len);
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
enum Status {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Connecting,
            1 => Status::Connected,
            2 => Status::Disconnecting,
            _ => Status::Disconnected,
        }
    }
}

type CloseCallback = Box<dyn FnMut(&Arc<TcpConnection>)>;

/// One accepted or connected socket, plus everything needed to read, write,
/// and tear it down. Always held behind an `Arc` once constructed: `send()`
/// is the one method meant to be called concurrently from any thread (it
/// marshals onto the connection's own loop thread). Every other method
/// follows the same single-caller-at-a-time discipline as the rest of this
/// crate's loop-thread-confined types, ordinarily only safe to call from
/// that loop thread.
pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    event_loop: EventLoop,
    name: String,
    status: AtomicU8,
    is_reading: Cell<bool>,
    socket: Socket,
    channel: Channel,
    local_addr: Endpoint,
    peer_addr: Endpoint,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    close_callback: RefCell<Option<CloseCallback>>,
    high_water_mark: usize,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: &EventLoop,
        name: String,
        fd: OwnedFd,
        local_addr: Endpoint,
        peer_addr: Endpoint,
    ) -> io::Result<Arc<TcpConnection>> {
        let socket = Socket::from_owned_fd(fd);
        socket.set_keepalive(true)?;
        let channel = Channel::new(event_loop, socket.as_raw_fd());

        let conn = Arc::new_cyclic(|weak_self| TcpConnection {
            self_weak: weak_self.clone(),
            event_loop: event_loop.clone(),
            name,
            status: AtomicU8::new(Status::Connecting as u8),
            is_reading: Cell::new(true),
            socket,
            channel: channel.clone(),
            local_addr,
            peer_addr,
            connection_callback: RefCell::new(default_connection_callback()),
            message_callback: RefCell::new(default_message_callback()),
            write_complete_callback: RefCell::new(None),
            high_water_mark_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            context: RefCell::new(None),
        });

        let weak = conn.self_weak.clone();
        channel.set_read_callback(move |received_at| {
            if let Some(c) = weak.upgrade() {
                c.handle_read(received_at);
            }
        });
        let weak = conn.self_weak.clone();
        channel.set_write_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        });
        let weak = conn.self_weak.clone();
        channel.set_close_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_close();
            }
        });
        let weak = conn.self_weak.clone();
        channel.set_error_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        });

        log::debug!(
            "TcpConnection::new [{}] fd = {}",
            conn.name,
            conn.channel.fd()
        );

        Ok(conn)
    }

    fn arc(&self) -> Arc<TcpConnection> {
        self.self_weak.upgrade().expect("TcpConnection outlived its own Arc")
    }

    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn local_address(&self) -> Endpoint {
        self.local_addr
    }

    pub fn peer_address(&self) -> Endpoint {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.status() == Status::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.status() == Status::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.is_reading.get()
    }

    pub fn input_buffer(&self) -> std::cell::RefMut<'_, Buffer> {
        self.input_buffer.borrow_mut()
    }

    pub fn output_buffer(&self) -> std::cell::RefMut<'_, Buffer> {
        self.output_buffer.borrow_mut()
    }

    pub fn set_context<T: 'static>(&self, value: T) {
        *self.context.borrow_mut() = Some(Box::new(value));
    }

    pub fn with_context<T: 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let ctx = self.context.borrow();
        f(ctx.as_ref().and_then(|b| b.downcast_ref::<T>()))
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_mark_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_tcp_no_delay(&self) -> io::Result<()> {
        self.socket.set_nodelay(true)
    }

    /// Queues `data` for writing. Safe to call concurrently from any number
    /// of threads: the status check and the send itself both run on the
    /// connection's own loop thread, reached via `run_in_loop` when the
    /// caller isn't already there.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.event_loop.is_in_loop_thread() {
            if self.status() == Status::Connected {
                self.send_in_loop(data);
            }
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            self.event_loop.run_in_loop(move || {
                if this.status() == Status::Connected {
                    this.send_in_loop(&owned);
                }
            });
        }
    }

    /// Half-closes the write side once pending output drains. Not safe to
    /// call concurrently from multiple threads on the same connection.
    pub fn shutdown(self: &Arc<Self>) {
        if self.status() == Status::Connected {
            self.set_status(Status::Disconnecting);
            let this = self.clone();
            self.event_loop.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.status(), Status::Connected | Status::Disconnecting) {
            self.set_status(Status::Disconnecting);
            let this = self.clone();
            self.event_loop.queue_in_loop(move || this.force_close_in_loop());
        }
    }

    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.status(), Status::Connected | Status::Disconnecting) {
            self.set_status(Status::Disconnecting);
            let weak = self.self_weak.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || this.start_read_in_loop());
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || this.stop_read_in_loop());
    }

    /// Finishes wiring the connection into its loop; called exactly once by
    /// the owning `TcpServer`/`TcpClient` right after construction.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.status(), Status::Connecting);
        self.set_status(Status::Connected);
        self.channel.tie(&(self.clone() as Arc<dyn Any + Send + Sync>));
        self.channel.enable_read();

        call_connection_cb(&self.connection_callback.borrow(), &self.arc());
    }

    /// Called exactly once by the owner when the connection is removed from
    /// its bookkeeping map.
    pub(crate) fn connect_destroy(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.status() == Status::Connected {
            self.set_status(Status::Disconnected);
            self.channel.disable_all();
            call_connection_cb(&self.connection_callback.borrow(), &self.arc());
        }
        self.channel.remove();
    }

    fn handle_read(&self, received_at: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let (n, errno) = self.input_buffer.borrow_mut().read_fd(self.channel.fd());
        if n > 0 {
            let conn = self.arc();
            call_message_cb(
                &self.message_callback.borrow(),
                &conn,
                &mut self.input_buffer.borrow_mut(),
                received_at,
            );
        } else if n == 0 {
            self.handle_close();
        } else {
            log::error!("TcpConnection::handle_read [{}]: {}", self.name, io::Error::from_raw_os_error(errno));
            self.handle_error();
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            log::trace!("connection fd = {} is down, no more writing", self.channel.fd());
            return;
        }

        let mut output = self.output_buffer.borrow_mut();
        let n = unsafe {
            libc::write(
                self.channel.fd(),
                output.peek().as_ptr() as *const libc::c_void,
                output.readable(),
            )
        };
        if n > 0 {
            output.retrieve(n as usize);
            if output.readable() == 0 {
                self.channel.disable_write();
                if let Some(cb) = self.write_complete_callback.borrow().clone() {
                    let this = self.arc();
                    self.event_loop
                        .queue_in_loop(move || call_write_complete_cb(&cb, &this));
                }
                if self.status() == Status::Disconnecting {
                    drop(output);
                    self.shutdown_in_loop();
                }
            }
        } else {
            log::error!("TcpConnection::handle_write [{}]: {}", self.name, crate::error::last_os_error());
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        log::trace!("fd = {} status = {:?}", self.channel.fd(), self.status());
        assert!(matches!(self.status(), Status::Connected | Status::Disconnecting));
        self.set_status(Status::Disconnected);
        self.channel.disable_all();

        let guard = self.arc();
        call_connection_cb(&self.connection_callback.borrow(), &guard);
        if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        self.event_loop.assert_in_loop_thread();
        if let Ok(Some(err)) = self.socket.take_error() {
            log::error!("TcpConnection::handle_error [{}]: {}", self.name, err);
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.status() == Status::Disconnected {
            log::warn!("disconnected, give up writing");
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.borrow().readable() == 0 {
            let n = unsafe { libc::write(self.channel.fd(), data.as_ptr() as *const libc::c_void, data.len()) };
            if n >= 0 {
                written = n as usize;
                if written == data.len() {
                    if let Some(cb) = self.write_complete_callback.borrow().clone() {
                        let this = self.arc();
                        self.event_loop
                            .queue_in_loop(move || call_write_complete_cb(&cb, &this));
                    }
                }
            } else {
                let err = crate::error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    log::error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                    if matches!(err.raw_os_error(), Some(libc::ECONNRESET) | Some(libc::EPIPE)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && written < data.len() {
            let remaining = &data[written..];
            let old_len = self.output_buffer.borrow().readable();
            if old_len + remaining.len() >= self.high_water_mark
                && old_len < self.high_water_mark
            {
                if let Some(cb) = self.high_water_mark_callback.borrow().clone() {
                    let this = self.arc();
                    let new_len = old_len + remaining.len();
                    self.event_loop
                        .queue_in_loop(move || call_high_water_mark_cb(&cb, &this, new_len));
                }
            }
            self.output_buffer.borrow_mut().append(remaining);
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                log::warn!("TcpConnection::shutdown_in_loop [{}]: {}", self.name, e);
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if matches!(self.status(), Status::Connected | Status::Disconnecting) {
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.is_reading.get() || !self.channel.is_reading() {
            self.channel.enable_read();
            self.is_reading.set(true);
        }
    }

    fn stop_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.is_reading.get() || self.channel.is_reading() {
            self.channel.disable_read();
            self.is_reading.set(false);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("fd", &self.channel.fd())
            .finish()
    }
}

// `TcpConnection` is always reached through an `Arc`, and `send()` is the one
// method meant to be called from any thread (its status check and fd write
// happen only on the connection's own loop thread); every `Cell`/`RefCell`
// field is otherwise read and written only from that same thread by the
// rest of this type's methods, which callers must not invoke concurrently.
// The callback handles (`ConnectionCallback` & co.) are the exception: they
// are `Arc<Mutex<dyn FnMut + Send>>`, not `Rc<RefCell<...>>`, because
// `TcpServer` installs the same callback object on every connection it
// hands out and those connections run on different pool threads — the
// `Mutex` makes the resulting concurrent invocation sound, so holding the
// handle in a `RefCell` here (swapped only from this connection's own loop
// thread via `set_connection_callback` & co.) is safe.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}
