//! Round-robin dispatch across sub-loops and cross-thread sends.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::ThreadId;
use std::time::Duration;

use riptide::{LoopThread, ServerOption, TcpConnection, TcpServer};

#[test]
fn connections_distribute_round_robin_across_workers() {
    let mut base_thread = LoopThread::new("dispatch-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "dispatch",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(4);

    let (tx, rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            tx.send(std::thread::current().id()).unwrap();
        }
    }));
    server.start();
    let addr = server.listen_addr().unwrap();

    // connect one at a time so accept order is the connect order
    let mut clients = Vec::new();
    let mut owners: Vec<ThreadId> = Vec::new();
    for _ in 0..8 {
        clients.push(TcpStream::connect(addr).unwrap());
        owners.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    let distinct: HashSet<ThreadId> = owners.iter().copied().collect();
    assert_eq!(distinct.len(), 4, "eight connections over four workers");
    // the cycle repeats: connection i and i+4 land on the same loop
    for i in 0..4 {
        assert_eq!(owners[i], owners[i + 4]);
    }
}

#[test]
fn all_callbacks_for_a_connection_fire_on_its_owning_thread() {
    let mut base_thread = LoopThread::new("affinity-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "affinity",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(2);

    let connect_threads: Arc<Mutex<HashMap<String, ThreadId>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let message_threads: Arc<Mutex<HashMap<String, ThreadId>>> =
        Arc::new(Mutex::new(HashMap::new()));

    {
        let connect_threads = connect_threads.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connect_threads
                    .lock()
                    .unwrap()
                    .insert(conn.name().to_string(), std::thread::current().id());
            }
        }));
    }
    {
        let message_threads = message_threads.clone();
        server.set_message_callback(Arc::new(move |conn, buf, _ts| {
            message_threads
                .lock()
                .unwrap()
                .insert(conn.name().to_string(), std::thread::current().id());
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
        }));
    }
    server.start();
    let addr = server.listen_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
        clients.push(client);
    }

    let connects = connect_threads.lock().unwrap();
    let messages = message_threads.lock().unwrap();
    assert_eq!(connects.len(), 4);
    assert_eq!(messages.len(), 4);
    for (name, connect_thread) in connects.iter() {
        assert_eq!(
            messages.get(name),
            Some(connect_thread),
            "message callback for {} moved off its owning thread",
            name
        );
    }
}

#[test]
fn send_from_foreign_thread_is_marshalled() {
    let mut base_thread = LoopThread::new("xsend-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "xsend",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(1);

    let slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let (connected_tx, connected_rx) = mpsc::channel();
    {
        let slot = slot.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *slot.lock().unwrap() = Some(conn.clone());
                connected_tx.send(()).unwrap();
            }
        }));
    }
    server.start();
    let addr = server.listen_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    connected_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let conn = slot.lock().unwrap().clone().unwrap();
    // this test thread is not the owning loop
    assert!(!conn.owner_loop().is_in_loop_thread());
    conn.send(b"x");

    let mut received = [0u8; 1];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"x");
}
