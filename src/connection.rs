//! Per-connection state machine.
//!
//! A connection lives on one sub-loop: every read, write, state change,
//! and user callback for it happens on that loop's thread. `send` and
//! `shutdown` may be called from anywhere; off-thread calls are marshalled
//! over. Outbound data takes one direct write when nothing is queued, and
//! anything left over is buffered with write-readiness armed until the
//! buffer drains. Crossing the high-water mark on the way up notifies the
//! user to throttle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket::Socket;
use crate::time::Timestamp;
use crate::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states. Transitions only move forward:
/// Connecting → Connected → (Disconnecting →) Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            3 => ConnState::Disconnected,
            _ => ConnState::Connecting,
        }
    }
}

/// Callbacks wired into a connection at construction; the server clones
/// its user-installed callbacks in here and adds its own close hook.
pub(crate) struct ConnectionCallbacks {
    pub(crate) on_connection: Option<ConnectionCallback>,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_write_complete: Option<WriteCompleteCallback>,
    pub(crate) on_high_water: Option<HighWaterMarkCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

/// One established TCP connection, shared by handle.
///
/// The server registry holds one strong handle; the channel holds a weak
/// one that is upgraded around event dispatch so the connection survives
/// removal happening mid-callback.
pub struct TcpConnection {
    loop_: EventLoop,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    self_weak: Weak<TcpConnection>,
    on_connection: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_high_water: Option<HighWaterMarkCallback>,
    on_close: Option<CloseCallback>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        callbacks: ConnectionCallbacks,
    ) -> Arc<TcpConnection> {
        if let Err(err) = socket.set_keepalive(true) {
            warn!(%name, %err, "failed to enable keepalive");
        }
        let channel = Channel::new(&event_loop, socket.fd());
        let conn = Arc::new_cyclic(|weak| TcpConnection {
            loop_: event_loop,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            self_weak: weak.clone(),
            on_connection: callbacks.on_connection,
            on_message: callbacks.on_message,
            on_write_complete: callbacks.on_write_complete,
            on_high_water: callbacks.on_high_water,
            on_close: callbacks.on_close,
            name,
        });
        debug!(name = %conn.name, fd = conn.socket.fd(), "connection created");
        conn
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn owner_loop(&self) -> &EventLoop {
        &self.loop_
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Bytes queued for sending above which the high-water callback fires.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    /// Toggle TCP_NODELAY on the underlying socket.
    pub fn set_nodelay(&self, on: bool) {
        if let Err(err) = self.socket.set_nodelay(on) {
            warn!(name = %self.name, %err, "failed to set nodelay");
        }
    }

    /// Queue `data` for the peer. Callable from any thread; bytes are
    /// copied if the call has to cross threads. Dropped with a log if the
    /// connection is no longer connected.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            warn!(
                name = %self.name,
                bytes = data.len(),
                "send on a connection that is not connected, dropping"
            );
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.handle();
            let data = data.to_vec();
            self.loop_.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }

        let mut written = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // nothing queued and not watching writability: try one direct write
        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    metrics::BYTES_SENT.add(n as u64);
                    written = n;
                    remaining = data.len() - n;
                    if remaining == 0 && let Some(callback) = &self.on_write_complete {
                        let callback = callback.clone();
                        let conn = self.handle();
                        self.loop_.queue_in_loop(move || callback(&conn));
                    }
                }
                Err(err) => {
                    written = 0;
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, %err, "write failed");
                        if matches!(
                            err.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) {
                            // the close surfaces through the next read or
                            // error event; do not buffer onto a dead socket
                            fault = true;
                        }
                    }
                }
            }
        }

        if remaining > 0 && !fault {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            if old_len + remaining >= mark
                && old_len < mark
                && let Some(callback) = &self.on_high_water
            {
                metrics::HIGH_WATER_EVENTS.increment();
                let callback = callback.clone();
                let conn = self.handle();
                let queued = old_len + remaining;
                self.loop_.queue_in_loop(move || callback(&conn, queued));
            }
            output.append(&data[written..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Close the write side once queued output has drained. The read side
    /// stays open until the peer closes.
    pub fn shutdown(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_ok() {
            let conn = self.handle();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        // still draining: handle_write finishes the half-close once the
        // output buffer empties
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!(name = %self.name, %err, "shutdown failed");
            }
        }
    }

    /// Final setup on the owning loop: tie the channel, arm reads, tell
    /// the user. Runs at most once, straight after construction.
    pub(crate) fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() != ConnState::Connecting {
            // a racing server teardown destroyed this connection first
            debug!(name = %self.name, "skipping establish, already torn down");
            return;
        }
        self.set_state(ConnState::Connected);
        metrics::CONNECTIONS_ACTIVE.increment();

        let conn = self.handle();
        let tie: Weak<dyn EventHandler> = self.self_weak.clone();
        self.channel.set_handler(tie);
        self.channel.enable_reading();

        info!(name = %self.name, peer = %self.peer_addr, "connection up");
        if let Some(callback) = &self.on_connection {
            callback(&conn);
        }
    }

    /// Final teardown on the owning loop, after the registry released its
    /// handle. Runs exactly once per connection.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        let prev = self.transition_to_disconnected();
        if prev == ConnState::Connected {
            // forced teardown without a close event (server shutdown)
            self.channel.disable_all();
            info!(name = %self.name, "connection down");
            let conn = self.handle();
            if let Some(callback) = &self.on_connection {
                callback(&conn);
            }
        }
        self.channel.remove();
        debug!(name = %self.name, "connection destroyed");
    }

    /// Move to Disconnected, balancing the active-connections gauge if
    /// the connection had been established. Returns the previous state.
    fn transition_to_disconnected(&self) -> ConnState {
        let prev = ConnState::from_u8(
            self.state
                .swap(ConnState::Disconnected as u8, Ordering::SeqCst),
        );
        if matches!(prev, ConnState::Connected | ConnState::Disconnecting) {
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
        prev
    }

    fn handle_close_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        info!(name = %self.name, state = ?self.state(), "connection closed by peer");
        self.transition_to_disconnected();
        self.channel.disable_all();

        // hold a strong handle across both callbacks: the close hook
        // removes this connection from the server registry
        let conn = self.handle();
        if let Some(callback) = &self.on_connection {
            callback(&conn);
        }
        if let Some(callback) = &self.on_close {
            callback(&conn);
        }
    }

    // Somebody must be holding a strong handle whenever this runs: the
    // registry, the channel tie during dispatch, or a queued task capture.
    fn handle(&self) -> Arc<TcpConnection> {
        self.self_weak
            .upgrade()
            .expect("connection outlived every strong handle")
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(&self, ts: Timestamp) {
        self.loop_.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_from_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close_in_loop();
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                trace!(name = %self.name, bytes = n, "read");
                if let Some(callback) = &self.on_message {
                    let conn = self.handle();
                    callback(&conn, &mut input, ts);
                }
            }
            Err(err) => {
                drop(input);
                error!(name = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write-readiness after disarm, ignoring");
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_to_fd(self.socket.fd()) {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    // drained: stop polling writability on an idle socket
                    self.channel.disable_writing();
                    if let Some(callback) = &self.on_write_complete {
                        let callback = callback.clone();
                        let conn = self.handle();
                        self.loop_.queue_in_loop(move || callback(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => {
                error!(name = %self.name, %err, "write failed");
            }
        }
    }

    fn handle_close(&self) {
        self.handle_close_in_loop();
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(err)) => err,
            Ok(None) => io::Error::other("no pending socket error"),
            Err(err) => err,
        };
        error!(name = %self.name, %err, "connection error");
    }
}
