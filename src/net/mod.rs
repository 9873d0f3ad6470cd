//! TCP networking built on [`crate::event_loop`]: non-blocking sockets,
//! buffered reads/writes, and the `TcpServer`/`TcpClient` facades.

mod acceptor;
mod callback;
mod client;
mod connection;
mod connector;
mod server;

pub use callback::{
    default_connection_callback, default_message_callback, ConnectionCallback, HighWaterMarkCallback,
    MessageCallback, WriteCompleteCallback,
};
pub use client::TcpClient;
pub use connection::TcpConnection;
pub use server::TcpServer;
