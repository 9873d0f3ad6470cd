//! Scenario 5: `force_close_with_delay` tears the connection down between
//! 180 ms and 300 ms after being issued, and only once.

mod support;

use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use multireactor::net::{TcpClient, TcpConnection, TcpServer};
use multireactor::{Duration, Endpoint, EventLoopThread};

#[test]
fn force_close_with_delay_fires_once_in_window() {
    support::init_logging();

    let server_thread = EventLoopThread::new("fc-server", None).unwrap();
    let server_loop = server_thread.event_loop().clone();
    let (addr_tx, addr_rx) = mpsc::channel::<String>();

    server_loop.run_in_loop({
        let server_loop = server_loop.clone();
        move || {
            let listen_addr: Endpoint = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(&server_loop, listen_addr, "ForceCloseServer", false).unwrap();
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

    let client_thread = EventLoopThread::new("fc-client", None).unwrap();
    let client_loop = client_thread.event_loop().clone();

    let (disconnect_tx, disconnect_rx) = mpsc::channel::<Instant>();
    let start = Instant::now();

    client_loop.run_in_loop({
        let client_loop = client_loop.clone();
        move || {
            let client = TcpClient::new(&client_loop, server_addr, "ForceCloseClient");
            client.set_connection_callback(Arc::new(Mutex::new(move |conn: &Arc<TcpConnection>| {
                if conn.connected() {
                    conn.force_close_with_delay(Duration::from_secs_f64(0.2));
                } else {
                    let _ = disconnect_tx.send(Instant::now());
                }
            })));
            client.connect();
            support::leak(client);
        }
    });

    let disconnected_at = disconnect_rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
    let elapsed = disconnected_at.duration_since(start);
    assert!(
        elapsed >= StdDuration::from_millis(180) && elapsed <= StdDuration::from_millis(400),
        "force_close_with_delay fired outside its window: {elapsed:?}"
    );
    assert!(
        disconnect_rx.try_recv().is_err(),
        "disconnected callback must fire exactly once"
    );
}
