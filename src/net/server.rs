//! Accepts connections on a listening endpoint and distributes them across
//! an `EventLoopThreadPool`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::socket::Socket;

use super::acceptor::Acceptor;
use super::callback::{default_connection_callback, default_message_callback};
use super::callback::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
use super::connection::TcpConnection;

type ConnectionMap = HashMap<String, Arc<TcpConnection>>;

pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    event_loop: EventLoop,
    ip_port: String,
    name: String,
    acceptor: RefCell<Option<Rc<Acceptor>>>,
    thread_pool: RefCell<EventLoopThreadPool>,
    thread_init_callback: RefCell<Option<ThreadInitCallback>>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    started: AtomicBool,
    next_conn_id: RefCell<i32>,
    connections: RefCell<ConnectionMap>,
}

impl TcpServer {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: Endpoint,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Rc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.ip_port();
        let thread_pool = EventLoopThreadPool::new(event_loop, name.clone());

        let server = Rc::new_cyclic(|weak_self| TcpServer {
            self_weak: weak_self.clone(),
            event_loop: event_loop.clone(),
            ip_port,
            name,
            acceptor: RefCell::new(Some(acceptor.clone())),
            thread_pool: RefCell::new(thread_pool),
            thread_init_callback: RefCell::new(None),
            connection_callback: RefCell::new(default_connection_callback()),
            message_callback: RefCell::new(default_message_callback()),
            write_complete_callback: RefCell::new(None),
            started: AtomicBool::new(false),
            next_conn_id: RefCell::new(1),
            connections: RefCell::new(HashMap::new()),
        });

        let weak = server.self_weak.clone();
        acceptor.set_new_connection_callback(move |fd, peer_addr| {
            if let Some(this) = weak.upgrade() {
                this.new_connection(fd, peer_addr);
            }
        });

        Ok(server)
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Must be called before `start()`.
    ///
    /// - 0 means all I/O runs on `event_loop`'s own thread (the default).
    /// - 1 means a single other thread handles all I/O.
    /// - N > 1 means a pool of N threads, new connections assigned round-robin.
    pub fn set_thread_number(&self, num: usize) {
        self.thread_pool.borrow_mut().set_thread_number(num);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.thread_init_callback.replace(Some(cb));
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

    /// Thread-safe; a no-op if already started.
    pub fn start(self: &Rc<Self>) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            if let Err(e) = this.thread_pool.borrow_mut().start(this.thread_init_callback.borrow_mut().take()) {
                log::error!("TcpServer::start could not start thread pool: {e}");
            }
        });

        let acceptor = self.acceptor.borrow().clone().expect("acceptor present");
        self.event_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                log::error!("TcpServer::start could not listen: {e}");
            }
        });

        Ok(())
    }

    fn new_connection(&self, fd: OwnedFd, peer_addr: Endpoint) {
        self.event_loop.assert_in_loop_thread();
        let loop_for_conn = self.thread_pool.borrow_mut().get_next_loop();

        let mut next_id = self.next_conn_id.borrow_mut();
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, *next_id);
        *next_id += 1;
        drop(next_id);

        log::info!(
            "TcpServer::new_connection [{}] new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );

        let socket = Socket::from_owned_fd(fd);
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("TcpServer::new_connection could not read local address: {e}");
                return;
            }
        };
        let fd = unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) };

        let conn = match TcpConnection::new(&loop_for_conn, conn_name.clone(), fd, local_addr, peer_addr) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("TcpServer::new_connection could not build connection: {e}");
                return;
            }
        };
        self.connections.borrow_mut().insert(conn_name, conn.clone());

        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }

        // The connection's own loop may be a pool thread, not this server's
        // base loop thread, so `weak` (an `Rc::Weak`) must never be upgraded
        // here directly — `Rc`'s strong count isn't atomic, and the acceptor
        // path upgrades the same `weak` on the base thread. Hop onto the
        // server's own loop (its `EventLoop` handle is `Arc`-based and safe
        // to clone/call from any thread) before touching any `Rc<TcpServer>`
        // state.
        let weak = self.self_weak.clone();
        let server_loop = self.event_loop.clone();
        conn.set_close_callback(move |conn| {
            let weak = weak.clone();
            let conn = conn.clone();
            server_loop.run_in_loop(move || {
                if let Some(this) = weak.upgrade() {
                    this.remove_connection(&conn);
                }
            });
        });

        let established = conn.clone();
        loop_for_conn.run_in_loop(move || established.connect_established());
    }

    /// Thread-safe: the connection's own loop (possibly a pool thread) calls
    /// this via its close callback, so it must hop back to the server's loop
    /// before touching `connections`.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.self_weak.clone();
        let conn = conn.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(this) = weak.upgrade() {
                this.remove_connection_in_loop(conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        log::info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.borrow_mut().remove(conn.name());
        assert!(removed.is_some());

        let loop_handle = conn.event_loop().clone();
        loop_handle.queue_in_loop(move || conn.connect_destroy());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        log::trace!("TcpServer::drop [{}]", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let loop_handle = conn.event_loop().clone();
            loop_handle.run_in_loop(move || conn.connect_destroy());
        }
    }
}
