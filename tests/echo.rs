//! End-to-end echo smoke test on a single-threaded server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use riptide::{LoopThread, ServerOption, TcpServer};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn echo_round_trip_single_threaded() {
    let mut base_thread = LoopThread::new("echo-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "echo",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(0);

    let connect_events = Arc::new(AtomicUsize::new(0));
    let message_events = Arc::new(AtomicUsize::new(0));
    let (disconnected_tx, disconnected_rx) = mpsc::channel();

    {
        let connect_events = connect_events.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            connect_events.fetch_add(1, Ordering::SeqCst);
            if !conn.connected() {
                disconnected_tx.send(()).unwrap();
            }
        }));
    }
    {
        let message_events = message_events.clone();
        server.set_message_callback(Arc::new(move |conn, buf, ts| {
            assert!(ts.is_valid());
            message_events.fetch_add(1, Ordering::SeqCst);
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
        }));
    }

    server.start();
    let addr = server.listen_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello").unwrap();

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");

    drop(client);
    disconnected_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no disconnect event");

    // connected once, disconnected once
    assert_eq!(connect_events.load(Ordering::SeqCst), 2);
    assert!(message_events.load(Ordering::SeqCst) >= 1);

    wait_for("registry to drain", || server.connection_count() == 0);
}

#[test]
fn echo_handles_multiple_messages_on_one_connection() {
    let mut base_thread = LoopThread::new("echo-multi-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "echo-multi",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(0);
    server.set_message_callback(Arc::new(move |conn, buf, _ts| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));
    server.start();
    let addr = server.listen_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for round in 0..10 {
        let payload = format!("message-{}", round);
        client.write_all(payload.as_bytes()).unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload.as_bytes());
    }
}
