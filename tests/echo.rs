//! Scenario 1: echo round-trip. A one-thread `TcpServer` on an OS-assigned
//! port echoes back whatever a `TcpClient` sends it.

mod support;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration as StdDuration;

use multireactor::net::{TcpClient, TcpConnection, TcpServer};
use multireactor::{Buffer, Endpoint, EventLoopThread, Timestamp};

#[test]
fn echo_round_trip() {
    support::init_logging();

    let server_thread = EventLoopThread::new("echo-server", None).unwrap();
    let server_loop = server_thread.event_loop().clone();

    let (addr_tx, addr_rx) = mpsc::channel::<String>();
    server_loop.run_in_loop({
        let server_loop = server_loop.clone();
        move || {
            let listen_addr: Endpoint = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(&server_loop, listen_addr, "EchoServer", false).unwrap();
            server.set_message_callback(Arc::new(Mutex::new(
                |conn: &Arc<TcpConnection>, buf: &mut Buffer, _ts: Timestamp| {
                    let bytes = buf.retrieve_all_as_vec();
                    conn.send(&bytes);
                },
            )));
            server.start().unwrap();
            addr_tx.send(server.ip_port().to_string()).unwrap();
            support::leak(server);
        }
    });

    let server_addr: Endpoint = addr_rx
        .recv_timeout(StdDuration::from_secs(5))
        .unwrap()
        .parse()
        .unwrap();

    let client_thread = EventLoopThread::new("echo-client", None).unwrap();
    let client_loop = client_thread.event_loop().clone();

    let (echo_tx, echo_rx) = mpsc::channel::<Vec<u8>>();
    client_loop.run_in_loop({
        let client_loop = client_loop.clone();
        move || {
            let client = TcpClient::new(&client_loop, server_addr, "EchoClient");
            client.set_connection_callback(Arc::new(Mutex::new({
                move |conn: &Arc<TcpConnection>| {
                    if conn.connected() {
                        conn.send(b"hello\n");
                    }
                }
            })));
            client.set_message_callback(Arc::new(Mutex::new(
                move |_conn: &Arc<TcpConnection>, buf: &mut Buffer, _ts: Timestamp| {
                    let bytes = buf.retrieve_all_as_vec();
                    let _ = echo_tx.send(bytes);
                },
            )));
            client.connect();
            support::leak(client);
        }
    });

    let echoed = echo_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    assert_eq!(echoed, b"hello\n");
}
