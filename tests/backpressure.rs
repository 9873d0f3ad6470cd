//! Scenario 2: partial-write backpressure. A client sends a 10 MiB payload
//! to a server that stops reading for 200 ms before draining it.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use multireactor::net::{TcpClient, TcpConnection, TcpServer};
use multireactor::{Buffer, Duration, Endpoint, EventLoopThread, Timestamp};

const PAYLOAD_LEN: usize = 10 * 1024 * 1024;

#[test]
fn ten_mib_payload_stays_below_high_water_mark() {
    support::init_logging();

    let server_thread = EventLoopThread::new("bp-server", None).unwrap();
    let server_loop = server_thread.event_loop().clone();

    let received = Arc::new(AtomicUsize::new(0));
    let (addr_tx, addr_rx) = mpsc::channel::<String>();

    server_loop.run_in_loop({
        let server_loop = server_loop.clone();
        let received = received.clone();
        move || {
            let listen_addr: Endpoint = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(&server_loop, listen_addr, "BackpressureServer", false).unwrap();

            server.set_connection_callback(Arc::new(Mutex::new({
                let server_loop = server_loop.clone();
                move |conn: &Arc<TcpConnection>| {
                    if conn.connected() {
                        conn.stop_read();
                        let conn = conn.clone();
                        server_loop.run_after(Duration::from_secs_f64(0.2), move || conn.start_read());
                    }
                }
            })));
            server.set_message_callback(Arc::new(Mutex::new({
                let received = received.clone();
                move |_conn: &Arc<TcpConnection>, buf: &mut Buffer, _ts: Timestamp| {
                    received.fetch_add(buf.readable(), Ordering::SeqCst);
                    buf.retrieve_all();
                }
            })));
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

    let client_thread = EventLoopThread::new("bp-client", None).unwrap();
    let client_loop = client_thread.event_loop().clone();

    let (write_complete_tx, write_complete_rx) = mpsc::channel::<()>();
    let (high_water_tx, high_water_rx) = mpsc::channel::<usize>();

    client_loop.run_in_loop({
        let client_loop = client_loop.clone();
        move || {
            let client = TcpClient::new(&client_loop, server_addr, "BackpressureClient");
            client.set_connection_callback(Arc::new(Mutex::new(move |conn: &Arc<TcpConnection>| {
                if !conn.connected() {
                    return;
                }
                let wc_tx = write_complete_tx.clone();
                conn.set_write_complete_callback(Arc::new(Mutex::new(move |_conn: &Arc<TcpConnection>| {
                    let _ = wc_tx.send(());
                })));
                let hw_tx = high_water_tx.clone();
                conn.set_high_water_mark_callback(Arc::new(Mutex::new(
                    move |_conn: &Arc<TcpConnection>, len: usize| {
                        let _ = hw_tx.send(len);
                    },
                )));
                conn.send(&vec![b'A'; PAYLOAD_LEN]);
            })));
            client.connect();
            support::leak(client);
        }
    });

    write_complete_rx.recv_timeout(StdDuration::from_secs(10)).unwrap();
    assert!(write_complete_rx.try_recv().is_err(), "write_complete must fire exactly once");
    assert!(
        high_water_rx.try_recv().is_err(),
        "a 10 MiB payload must stay under the default 60 MiB high-water mark"
    );

    std::thread::sleep(StdDuration::from_millis(500));
    assert_eq!(received.load(Ordering::SeqCst), PAYLOAD_LEN);
}
