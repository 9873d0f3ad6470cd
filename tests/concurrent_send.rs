//! Scenario 6: 8 threads each call `send` once on the same connection; the
//! server must see exactly 8 bytes, all `'X'`, with no corruption.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration as StdDuration;

use multireactor::net::{TcpClient, TcpConnection, TcpServer};
use multireactor::{Buffer, Endpoint, EventLoopThread, Timestamp};

#[test]
fn eight_threads_sending_one_byte_each_arrive_uncorrupted() {
    support::init_logging();

    let server_thread = EventLoopThread::new("cs-server", None).unwrap();
    let server_loop = server_thread.event_loop().clone();
    let (addr_tx, addr_rx) = mpsc::channel::<String>();
    let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>();

    server_loop.run_in_loop({
        let server_loop = server_loop.clone();
        move || {
            let listen_addr: Endpoint = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(&server_loop, listen_addr, "ConcurrentSendServer", false).unwrap();
            server.set_message_callback(Arc::new(Mutex::new(move |_conn: &Arc<TcpConnection>,
                                                                    buf: &mut Buffer,
                                                                    _ts: Timestamp| {
                if buf.readable() >= 8 {
                    let _ = bytes_tx.send(buf.retrieve_all_as_vec());
                }
            })));
            server.start().unwrap();
            addr_tx.send(server.ip_port().to_string()).unwrap();
            support::leak(server);
        }
    });

    let server_addr: Endpoint = addr_rx.recv_timeout(StdDuration::from_secs(5)).unwrap().parse().unwrap();

    let client_thread = EventLoopThread::new("cs-client", None).unwrap();
    let client_loop = client_thread.event_loop().clone();

    let (conn_tx, conn_rx) = mpsc::channel::<Arc<TcpConnection>>();
    client_loop.run_in_loop({
        let client_loop = client_loop.clone();
        move || {
            let client = TcpClient::new(&client_loop, server_addr, "ConcurrentSendClient");
            client.set_connection_callback(Arc::new(Mutex::new(move |conn: &Arc<TcpConnection>| {
                if conn.connected() { let _ = conn_tx.send(conn.clone()); }
            })));
            client.connect();
            support::leak(client);
        }
    });

    // `Arc<TcpConnection>` is `Send + Sync`: `send()`'s status check and the
    // fd write both run on the connection's own loop thread regardless of
    // which thread calls it, so handing clones to worker threads is sound.
    let conn = conn_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    let barrier = Arc::new(Barrier::new(8));
    let failed = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            let barrier = barrier.clone();
            let failed = failed.clone();
            std::thread::spawn(move || {
                barrier.wait();
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| conn.send(b"X"))).is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles { let _ = h.join(); }
    assert!(!failed.load(Ordering::SeqCst), "send panicked on at least one thread");

    let received = bytes_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    assert_eq!(received.len(), 8);
    assert!(received.iter().all(|&b| b == b'X'));
}
