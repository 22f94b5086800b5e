//! Output buffering under a slow reader: high-water notification and
//! write-complete after the drain.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use riptide::{LoopThread, ServerOption, TcpServer};

const CHUNK: usize = 256 * 1024;
const CHUNKS: usize = 128; // 32 MiB total, far beyond any socket buffer

#[test]
fn high_water_mark_fires_and_output_drains() {
    let mut base_thread = LoopThread::new("bp-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "backpressure",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(1);

    let high_water_events = Arc::new(AtomicUsize::new(0));
    let high_water_peak = Arc::new(AtomicUsize::new(0));
    let (write_complete_tx, write_complete_rx) = mpsc::channel();

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.set_high_water_mark(1024);
        }
    }));
    {
        let events = high_water_events.clone();
        let peak = high_water_peak.clone();
        server.set_high_water_mark_callback(Arc::new(move |_conn, queued| {
            events.fetch_add(1, Ordering::SeqCst);
            peak.fetch_max(queued, Ordering::SeqCst);
        }));
    }
    server.set_write_complete_callback(Arc::new(move |_conn| {
        let _ = write_complete_tx.send(());
    }));
    let burst_sent = Arc::new(AtomicUsize::new(0));
    server.set_message_callback(Arc::new(move |conn, buf, _ts| {
        buf.retrieve_all();
        // one burst per connection no matter how the trigger fragments
        if burst_sent.fetch_add(1, Ordering::SeqCst) > 0 {
            return;
        }
        let chunk = vec![0x5au8; CHUNK];
        for _ in 0..CHUNKS {
            conn.send(&chunk);
        }
    }));

    server.start();
    let addr = server.listen_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    client.write_all(b"go").unwrap();

    // let the server wedge against full kernel buffers before draining
    std::thread::sleep(Duration::from_millis(300));

    let mut received = 0usize;
    let mut scratch = vec![0u8; 64 * 1024];
    while received < CHUNK * CHUNKS {
        let n = client.read(&mut scratch).expect("read stalled");
        assert!(n > 0, "peer closed early");
        assert!(scratch[..n].iter().all(|&b| b == 0x5a));
        received += n;
    }
    assert_eq!(received, CHUNK * CHUNKS);

    write_complete_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no write-complete event");

    assert!(
        high_water_events.load(Ordering::SeqCst) >= 1,
        "high-water mark never fired"
    );
    assert!(
        high_water_peak.load(Ordering::SeqCst) >= 1024,
        "high-water callback reported fewer bytes than the mark"
    );
}

#[test]
fn small_sends_complete_without_high_water() {
    let mut base_thread = LoopThread::new("bp-small-base", None);
    let base = base_thread.start_loop();

    let server = TcpServer::new(
        &base,
        "127.0.0.1:0".parse().unwrap(),
        "no-pressure",
        ServerOption::NoReusePort,
    )
    .unwrap();
    server.set_thread_num(1);

    let high_water_events = Arc::new(AtomicUsize::new(0));
    let (write_complete_tx, write_complete_rx) = mpsc::channel();

    {
        let events = high_water_events.clone();
        server.set_high_water_mark_callback(Arc::new(move |_conn, _queued| {
            events.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.set_write_complete_callback(Arc::new(move |_conn| {
        let _ = write_complete_tx.send(());
    }));
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
    client.write_all(b"tiny").unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).unwrap();

    write_complete_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no write-complete event");
    assert_eq!(high_water_events.load(Ordering::SeqCst), 0);
}
