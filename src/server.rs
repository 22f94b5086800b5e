//! The server façade: acceptor on the base loop, a pool of sub-loops, and
//! the registry of live connections.
//!
//! New connections are handed from the acceptor to a sub-loop picked
//! round-robin; from then on everything about that connection happens on
//! its sub-loop. The registry itself is only touched from the base loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::connection::{ConnectionCallbacks, TcpConnection};
use crate::event_loop::EventLoop;
use crate::pool::LoopPool;
use crate::socket::Socket;
use crate::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback,
    WriteCompleteCallback,
};

/// Whether the listening socket binds with SO_REUSEPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

/// A multi-reactor TCP server.
///
/// Construct, install callbacks, pick a worker count, then
/// [`start`](Self::start). Dropping the server releases every live
/// connection and tears them down on their owning loops.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base_loop: EventLoop,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<LoopPool>,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_high_water: Mutex<Option<HighWaterMarkCallback>>,
    thread_init: Mutex<Option<ThreadInitCallback>>,
    next_conn_id: AtomicU64,
    started: AtomicU32,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    /// Bind a server named `name` on `listen_addr`, accepting on
    /// `base_loop`.
    pub fn new(
        base_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(
            base_loop,
            &listen_addr,
            option == ServerOption::ReusePort,
        )?;
        // the kernel may have picked the port (bind to :0)
        let bound = acceptor.local_addr().unwrap_or(listen_addr);

        let inner = Arc::new(ServerInner {
            base_loop: base_loop.clone(),
            ip_port: bound.to_string(),
            pool: Arc::new(LoopPool::new(base_loop.clone(), name.clone())),
            name,
            acceptor,
            on_connection: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            on_high_water: Mutex::new(None),
            thread_init: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            started: AtomicU32::new(0),
            connections: Mutex::new(HashMap::new()),
        });

        let server = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Arc::new(move |socket, peer_addr| {
                if let Some(server) = server.upgrade() {
                    ServerInner::new_connection(&server, socket, peer_addr);
                }
            }));

        Ok(TcpServer { inner })
    }

    /// The address the listener is bound to.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of sub-loop threads. Zero keeps all I/O on the base loop.
    /// Must be called before [`start`](Self::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.set_thread_num(num_threads);
    }

    /// Invoked on the owning sub-loop once when a connection reaches
    /// Connected and once when it reaches Disconnected.
    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.inner.on_connection.lock().unwrap() = Some(callback);
    }

    /// Invoked on the owning sub-loop when bytes arrive.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.inner.on_message.lock().unwrap() = Some(callback);
    }

    /// Invoked on the owning sub-loop when the output buffer drains.
    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.inner.on_write_complete.lock().unwrap() = Some(callback);
    }

    /// Invoked on the owning sub-loop when queued output crosses the
    /// high-water mark on the way up.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback) {
        *self.inner.on_high_water.lock().unwrap() = Some(callback);
    }

    /// Invoked once on each sub-loop thread as it starts.
    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.inner.thread_init.lock().unwrap() = Some(callback);
    }

    /// Number of live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Start the pool and begin listening. Calling more than once is a
    /// no-op.
    pub fn start(&self) {
        if self.inner.started.fetch_add(1, Ordering::SeqCst) == 0 {
            let inner = self.inner.clone();
            self.inner.base_loop.run_in_loop(move || {
                let init = inner.thread_init.lock().unwrap().clone();
                inner.pool.start(init);
                inner.acceptor.listen();
            });
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!(name = %self.inner.name, "server shutting down");
        let connections: Vec<Arc<TcpConnection>> = self
            .inner
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let owner = conn.owner_loop().clone();
            owner.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl ServerInner {
    /// Runs on the base loop for every accepted socket.
    fn new_connection(server: &Arc<ServerInner>, socket: Socket, peer_addr: SocketAddr) {
        server.base_loop.assert_in_loop_thread();
        let io_loop = server.pool.next_loop();

        let id = server.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", server.name, server.ip_port, id);
        info!(server = %server.name, name = %conn_name, peer = %peer_addr, "new connection");

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!(name = %conn_name, %err, "getsockname failed");
                SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
            }
        };

        let close_server = Arc::downgrade(server);
        let callbacks = ConnectionCallbacks {
            on_connection: server.on_connection.lock().unwrap().clone(),
            on_message: server.on_message.lock().unwrap().clone(),
            on_write_complete: server.on_write_complete.lock().unwrap().clone(),
            on_high_water: server.on_high_water.lock().unwrap().clone(),
            on_close: Some(Arc::new(move |conn: &Arc<TcpConnection>| {
                if let Some(server) = close_server.upgrade() {
                    ServerInner::remove_connection(&server, conn);
                }
            })),
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
            callbacks,
        );
        server
            .connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on whichever sub-loop observed the close; hops to the base
    /// loop to touch the registry.
    fn remove_connection(server: &Arc<ServerInner>, conn: &Arc<TcpConnection>) {
        let server = server.clone();
        let conn = conn.clone();
        server
            .base_loop
            .clone()
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.base_loop.assert_in_loop_thread();
        // a server teardown may already have drained the registry; destroy
        // runs exactly once either way
        if self.connections.lock().unwrap().remove(conn.name()).is_none() {
            return;
        }
        info!(server = %self.name, name = %conn.name(), "removing connection");

        let owner = conn.owner_loop().clone();
        let conn = conn.clone();
        owner.queue_in_loop(move || conn.connect_destroyed());
    }
}
