//! Connects to a remote endpoint (optionally reconnecting) and hands back a
//! single `TcpConnection`.

use std::cell::{Cell, RefCell};
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

use super::callback::{default_connection_callback, default_message_callback};
use super::callback::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
use super::connection::TcpConnection;
use super::connector::Connector;

pub struct TcpClient {
    self_weak: Weak<TcpClient>,
    event_loop: EventLoop,
    connector: Rc<Connector>,
    name: String,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    retry: Cell<bool>,
    is_connect: Cell<bool>,
    next_conn_id: Cell<i32>,
    connection: RefCell<Option<Arc<TcpConnection>>>,
}

impl TcpClient {
    pub fn new(event_loop: &EventLoop, server_addr: Endpoint, name: impl Into<String>) -> Rc<TcpClient> {
        let name = name.into();
        let connector = Connector::new(event_loop, server_addr);

        let client = Rc::new_cyclic(|weak_self| TcpClient {
            self_weak: weak_self.clone(),
            event_loop: event_loop.clone(),
            connector: connector.clone(),
            name,
            connection_callback: RefCell::new(default_connection_callback()),
            message_callback: RefCell::new(default_message_callback()),
            write_complete_callback: RefCell::new(None),
            retry: Cell::new(false),
            is_connect: Cell::new(false),
            next_conn_id: Cell::new(1),
            connection: RefCell::new(None),
        });

        let weak = client.self_weak.clone();
        connector.set_connection_callback(move |fd| {
            if let Some(this) = weak.upgrade() {
                this.new_connection(fd);
            }
        });

        log::info!("TcpClient::new [{}] - connector {:p}", client.name, Rc::as_ptr(&connector));

        client
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.borrow().clone()
    }

    pub fn retry(&self) -> bool {
        self.retry.get()
    }

    pub fn enable_retry(&self) {
        self.retry.set(true);
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

    pub fn connect(self: &Rc<Self>) {
        if !self.is_connect.get() {
            log::info!(
                "TcpClient::connect [{}] - connecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.is_connect.set(true);
            self.connector.start();
        }
    }

    pub fn disconnect(&self) {
        if self.is_connect.get() {
            self.is_connect.set(false);
            if let Some(conn) = self.connection.borrow().clone() {
                conn.shutdown();
            }
        }
    }

    pub fn stop(&self) {
        self.is_connect.set(false);
        self.connector.stop();
    }

    fn new_connection(&self, fd: OwnedFd) {
        self.event_loop.assert_in_loop_thread();

        let socket = Socket::from_owned_fd(fd);
        let (local_addr, peer_addr) = match (socket.local_addr(), socket.peer_addr()) {
            (Ok(l), Ok(p)) => (l, p),
            (l, p) => {
                log::error!(
                    "TcpClient::new_connection could not read addresses: {:?}",
                    l.err().or(p.err())
                );
                return;
            }
        };
        let fd = unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) };

        let next_id = self.next_conn_id.get();
        self.next_conn_id.set(next_id + 1);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, next_id);

        let conn = match TcpConnection::new(&self.event_loop, conn_name, fd, local_addr, peer_addr) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("TcpClient::new_connection could not build connection: {e}");
                return;
            }
        };

        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(move |conn| {
            if let Some(this) = weak.upgrade() {
                this.remove_connection(conn);
            }
        });

        *self.connection.borrow_mut() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();

        {
            let mut slot = self.connection.borrow_mut();
            assert!(slot.as_ref().map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false));
            *slot = None;
        }

        let loop_handle = conn.event_loop().clone();
        let conn = conn.clone();
        loop_handle.queue_in_loop(move || conn.connect_destroy());

        if self.retry.get() && self.is_connect.get() {
            log::info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::info!("TcpClient::drop [{}] - connector {:p}", self.name, Rc::as_ptr(&self.connector));

        let conn = self.connection.borrow().clone();
        match conn {
            Some(conn) => {
                let is_unique = Arc::strong_count(&conn) == 1;
                conn.set_close_callback(|conn| {
                    let loop_handle = conn.event_loop().clone();
                    let conn = conn.clone();
                    loop_handle.queue_in_loop(move || conn.connect_destroy());
                });
                if is_unique {
                    conn.force_close();
                }
            }
            None => {
                self.connector.stop();
            }
        }
    }
}
