//! Shared callback type aliases used across [`super::connection`],
//! [`super::server`], and [`super::client`].

use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::time::Timestamp;

use super::connection::TcpConnection;

// `Arc<Mutex<...>>`, not `Rc<RefCell<...>>`: `TcpServer` installs the same
// callback object on every connection it accepts, and those connections are
// fanned across an `EventLoopThreadPool`, so two connections on two
// different OS threads can end up invoking the same callback at the same
// time. A `Mutex` serializes that; a `RefCell`'s borrow flag is not atomic
// and would race.
pub type ConnectionCallback = Arc<Mutex<dyn FnMut(&Arc<TcpConnection>) + Send>>;
pub type MessageCallback = Arc<Mutex<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send>>;
pub type WriteCompleteCallback = Arc<Mutex<dyn FnMut(&Arc<TcpConnection>) + Send>>;
pub type HighWaterMarkCallback = Arc<Mutex<dyn FnMut(&Arc<TcpConnection>, usize) + Send>>;

pub fn default_connection_callback() -> ConnectionCallback {
    Arc::new(Mutex::new(|conn: &Arc<TcpConnection>| {
        log::trace!(
            "{} -> {} is {}",
            conn.local_address(),
            conn.peer_address(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    }))
}

pub fn default_message_callback() -> MessageCallback {
    Arc::new(Mutex::new(
        |_conn: &Arc<TcpConnection>, buf: &mut Buffer, _received_at: Timestamp| {
            buf.retrieve_all();
        },
    ))
}
