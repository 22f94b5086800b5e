//! riptide - a multi-reactor TCP server runtime.
//!
//! One event loop per thread: a base loop owns the listening socket and
//! accepts; a pool of sub-loops each own a slice of the accepted
//! connections and do all of their I/O. Per-connection callbacks run
//! serially on the connection's owning loop thread, and work initiated
//! from other threads is marshalled over through a wakeup-backed task
//! queue.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use riptide::{EventLoop, ServerOption, TcpServer};
//!
//! let base_loop = EventLoop::new()?;
//! let server = TcpServer::new(
//!     &base_loop,
//!     "0.0.0.0:7000".parse()?,
//!     "echo",
//!     ServerOption::NoReusePort,
//! )?;
//! server.set_thread_num(4);
//! server.set_message_callback(Arc::new(|conn, buf, _ts| {
//!     let msg = buf.retrieve_all_as_string();
//!     conn.send(msg.as_bytes());
//! }));
//! server.start();
//! base_loop.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod logging;
pub mod metrics;
mod poller;
pub mod pool;
pub mod server;
pub mod socket;
pub mod time;

use std::sync::Arc;

pub use buffer::Buffer;
pub use channel::{Channel, EventHandler, Interest, Ready};
pub use config::Config;
pub use connection::{ConnState, TcpConnection};
pub use event_loop::EventLoop;
pub use pool::{LoopPool, LoopThread};
pub use server::{ServerOption, TcpServer};
pub use time::Timestamp;

/// Invoked once when a connection reaches Connected and once when it
/// reaches Disconnected; check [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Invoked when bytes arrive; the buffer holds everything received so far
/// and the timestamp is the owning loop's poll-return time.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Invoked when the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Invoked with the queued byte count when the output buffer rises across
/// the high-water mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal hook the server installs to evict a closed connection from
/// its registry.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Invoked once on each sub-loop thread as it starts.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;
