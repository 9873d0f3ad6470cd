//! Scenario 3: a client configured to connect before its server exists
//! retries with exponential backoff and succeeds once the server starts.

mod support;

use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use multireactor::net::{TcpClient, TcpConnection, TcpServer};
use multireactor::{Endpoint, EventLoopThread};

#[test]
fn client_reconnects_once_server_appears() {
    support::init_logging();

    // An address nothing is listening on yet: bind a throwaway listener to
    // grab a free port, then drop it so the client's early connects fail
    // with ECONNREFUSED instead of hanging.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr: Endpoint = probe.local_addr().unwrap().into();
    drop(probe);

    let client_thread = EventLoopThread::new("reconnect-client", None).unwrap();
    let client_loop = client_thread.event_loop().clone();

    let (connected_tx, connected_rx) = mpsc::channel::<Instant>();
    let start = Instant::now();

    client_loop.run_in_loop({
        let client_loop = client_loop.clone();
        move || {
            let client = TcpClient::new(&client_loop, server_addr, "ReconnectClient");
            client.set_connection_callback(Arc::new(Mutex::new(move |conn: &Arc<TcpConnection>| {
                if conn.connected() {
                    let _ = connected_tx.send(Instant::now());
                }
            })));
            client.connect();
            support::leak(client);
        }
    });

    // Give the client a couple of failed attempts (t ~ 0, 0.5s) before the
    // server starts at t ~= 1.6s, matching the backoff sequence's first
    // doubling step.
    std::thread::sleep(StdDuration::from_millis(1_600));

    let server_thread = EventLoopThread::new("reconnect-server", None).unwrap();
    let server_loop = server_thread.event_loop().clone();
    server_loop.run_in_loop(move || {
        let server = TcpServer::new(&server_loop, server_addr, "ReconnectServer", false).unwrap();
        server.start().unwrap();
        support::leak(server);
    });

    let connected_at = connected_rx.recv_timeout(StdDuration::from_secs(10)).unwrap();
    let elapsed = connected_at.duration_since(start);
    assert!(
        elapsed >= StdDuration::from_millis(1_600) && elapsed < StdDuration::from_secs(10),
        "expected the client to connect shortly after the server started, got {elapsed:?}"
    );
}
