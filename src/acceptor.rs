//! Listening socket on the base loop.
//!
//! Accepts one connection per readiness event (level-triggered polling
//! re-fires while the backlog is non-empty) and hands the new socket to
//! the installed callback. A descriptor is held in reserve so that
//! hitting the process fd limit can be survived: close the spare, accept
//! and immediately close the pending connection, re-open the spare.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket::Socket;
use crate::time::Timestamp;

const BACKLOG: i32 = 4096;

pub(crate) type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    loop_: EventLoop,
    socket: Option<Socket>,
    channel: Arc<Channel>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<OwnedFd>>,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Bind a non-blocking listener on `addr`. Does not start listening;
    /// the server marshals [`listen`](Self::listen) onto the base loop.
    pub fn new(
        event_loop: &EventLoop,
        addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::tcp_nonblocking(addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(addr)?;

        let channel = Channel::new(event_loop, socket.fd());
        let acceptor = Arc::new(Acceptor {
            loop_: event_loop.clone(),
            socket: Some(socket),
            channel,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(reserve_fd().ok()),
            on_new_connection: Mutex::new(None),
        });
        let handler: Weak<dyn EventHandler> =
            Arc::downgrade(&(acceptor.clone() as Arc<dyn EventHandler>));
        acceptor.channel.set_handler(handler);
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_new_connection.lock().unwrap() = Some(callback);
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.socket {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::other("listener is gone")),
        }
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Start listening and arm read-readiness. Base loop only.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        let Some(socket) = &self.socket else { return };
        self.listening.store(true, Ordering::SeqCst);
        if let Err(err) = socket.listen(BACKLOG) {
            // nothing can be served without a listener
            panic!("listen failed: {}", err);
        }
        match socket.local_addr() {
            Ok(addr) => info!(%addr, "listening"),
            Err(_) => info!("listening"),
        }
        self.channel.enable_reading();
    }
}

impl EventHandler for Acceptor {
    fn handle_read(&self, _ts: Timestamp) {
        self.loop_.assert_in_loop_thread();
        let Some(socket) = &self.socket else { return };

        match socket.accept() {
            Ok((accepted, peer_addr)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                match Socket::from_accepted(accepted) {
                    Ok(accepted) => {
                        let callback = self.on_new_connection.lock().unwrap().clone();
                        match callback {
                            Some(callback) => callback(accepted, peer_addr),
                            // nobody wants it: drop closes the descriptor
                            None => drop(accepted),
                        }
                    }
                    Err(err) => error!(%err, "failed to configure accepted socket"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                error!("accept: process is out of file descriptors");
                let mut idle = self.idle_fd.lock().unwrap();
                if let Some(spare) = idle.take() {
                    drop(spare);
                    if let Ok((pending, peer_addr)) = socket.accept() {
                        warn!(%peer_addr, "shedding connection at fd limit");
                        drop(pending);
                    }
                    match reserve_fd() {
                        Ok(spare) => *idle = Some(spare),
                        Err(err) => error!(%err, "failed to re-reserve spare descriptor"),
                    }
                }
            }
            Err(err) => error!(%err, "accept failed"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // the channel must be detached on the owning thread, and the
        // listener descriptor must stay open until that has happened
        let channel = self.channel.clone();
        let socket = self.socket.take();
        self.loop_.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
            drop(socket);
        });
    }
}

fn reserve_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
