//! Binding of one descriptor to its event masks and its handler.
//!
//! A `Channel` belongs to exactly one [`EventLoop`](crate::EventLoop) for
//! its whole life. Interest-mask mutations are forwarded to the loop's
//! poller immediately, and must happen on the owning thread. The owner
//! (acceptor, connection, or the loop's own wakeup path) is reachable
//! through a weak handle that is upgraded for the duration of each
//! dispatch, so the owner cannot be destroyed mid-callback.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use tracing::trace;

use crate::event_loop::{EventLoop, LoopInner};
use crate::time::Timestamp;

bitflags! {
    /// Events a channel asks the poller to watch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

bitflags! {
    /// Readiness reported by the poller for one dispatch round.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR    = 1 << 2;
        const HANGUP   = 1 << 3;
    }
}

/// Poller-side registration state, stashed on the channel so the poller
/// can tell a first registration from a modification or a re-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PollerState {
    /// Never registered with the poller.
    New = 0,
    /// Registered with the OS and present in the poller's table.
    Added = 1,
    /// In the poller's table but deleted from the OS (empty interest).
    Deleted = 2,
}

impl PollerState {
    fn from_u8(v: u8) -> PollerState {
        match v {
            1 => PollerState::Added,
            2 => PollerState::Deleted,
            _ => PollerState::New,
        }
    }
}

/// Receiver of channel events.
///
/// One object per channel: a connection handles all four kinds, the
/// acceptor and the loop wakeup path only care about reads and keep the
/// default no-ops for the rest.
pub trait EventHandler: Send + Sync {
    /// The descriptor became readable. `ts` is the owning loop's last
    /// poll-return time.
    fn handle_read(&self, ts: Timestamp) {
        let _ = ts;
    }

    /// The descriptor became writable.
    fn handle_write(&self) {}

    /// The peer hung up with nothing left to read.
    fn handle_close(&self) {}

    /// The descriptor is in an error state.
    fn handle_error(&self) {}
}

/// One registered descriptor: interest mask, last-reported readiness,
/// and a weak handle to whoever consumes its events.
pub struct Channel {
    loop_: Weak<LoopInner>,
    self_weak: Weak<Channel>,
    fd: i32,
    interest: AtomicU32,
    ready: AtomicU32,
    poller_state: AtomicU8,
    handler: Mutex<Option<Weak<dyn EventHandler>>>,
}

impl Channel {
    /// Create a channel for `fd` owned by `event_loop`.
    ///
    /// The channel is inert until a handler is attached and an interest
    /// bit is enabled.
    pub fn new(event_loop: &EventLoop, fd: i32) -> Arc<Channel> {
        Self::with_loop(event_loop.downgrade_inner(), fd)
    }

    pub(crate) fn from_loop_inner(inner: &Arc<LoopInner>, fd: i32) -> Arc<Channel> {
        Self::with_loop(Arc::downgrade(inner), fd)
    }

    fn with_loop(loop_: Weak<LoopInner>, fd: i32) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            loop_,
            self_weak: self_weak.clone(),
            fd,
            interest: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            poller_state: AtomicU8::new(PollerState::New as u8),
            handler: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Attach the event consumer. The weak handle doubles as a lifetime
    /// guard: it is upgraded around every dispatch.
    pub fn set_handler(&self, handler: Weak<dyn EventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        Interest::from_bits_truncate(self.interest.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn ready(&self) -> Ready {
        Ready::from_bits_truncate(self.ready.load(Ordering::SeqCst))
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.ready.store(ready.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest().contains(Interest::READABLE)
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest().contains(Interest::WRITABLE)
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn enable_reading(&self) {
        self.interest
            .fetch_or(Interest::READABLE.bits(), Ordering::SeqCst);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.interest
            .fetch_and(!Interest::READABLE.bits(), Ordering::SeqCst);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest
            .fetch_or(Interest::WRITABLE.bits(), Ordering::SeqCst);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest
            .fetch_and(!Interest::WRITABLE.bits(), Ordering::SeqCst);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::SeqCst);
        self.update();
    }

    /// Unregister from the owning loop's poller. The owner calls this
    /// exactly once, at teardown, on the owning thread.
    pub fn remove(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        if let Some(inner) = self.loop_.upgrade() {
            inner.remove_channel(&this);
        }
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.poller_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::SeqCst);
    }

    fn update(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        if let Some(inner) = self.loop_.upgrade() {
            inner.update_channel(&this);
        }
    }

    /// Dispatch the last-reported readiness to the handler.
    ///
    /// The handler is upgraded to a strong handle first; if the owner is
    /// already gone the channel is orphaned and the events are dropped.
    /// Order: hangup-without-data, error, readable, writable.
    pub fn handle_event(&self, ts: Timestamp) {
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler.and_then(|weak| weak.upgrade()) else {
            trace!(fd = self.fd, "orphaned channel, dropping events");
            return;
        };

        let ready = self.ready();
        trace!(fd = self.fd, ?ready, "dispatching");

        if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            handler.handle_close();
        }
        if ready.contains(Ready::ERROR) {
            handler.handle_error();
        }
        if ready.contains(Ready::READABLE) {
            handler.handle_read(ts);
        }
        if ready.contains(Ready::WRITABLE) {
            handler.handle_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    struct NopHandler;
    impl EventHandler for NopHandler {}

    struct CountingHandler {
        reads: AtomicUsize,
        closes: AtomicUsize,
    }
    impl EventHandler for CountingHandler {
        fn handle_read(&self, _ts: Timestamp) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn interest_mask_transitions() {
        let event_loop = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let handler = Arc::new(NopHandler);
        let channel = Channel::new(&event_loop, a.as_raw_fd());
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn EventHandler>));
        channel.set_handler(weak);

        assert!(channel.is_none_event());
        channel.enable_reading();
        assert!(channel.is_reading());
        assert!(!channel.is_writing());
        assert!(event_loop.has_channel(&channel));

        channel.enable_writing();
        assert!(channel.is_reading());
        assert!(channel.is_writing());

        channel.disable_writing();
        assert!(!channel.is_writing());

        channel.disable_all();
        assert!(channel.is_none_event());
        // still in the table after an OS-level delete, so re-adding works
        assert!(event_loop.has_channel(&channel));
        channel.enable_reading();
        assert!(channel.is_reading());

        channel.remove();
        assert!(!event_loop.has_channel(&channel));
    }

    #[test]
    fn dispatch_order_and_counting() {
        let handler = Arc::new(CountingHandler {
            reads: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let event_loop = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn EventHandler>));
        channel.set_handler(weak);

        // hangup with readable data pending goes to the read path, not close
        channel.set_ready(Ready::READABLE | Ready::HANGUP);
        channel.handle_event(Timestamp::now());
        assert_eq!(handler.reads.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 0);

        // hangup alone is a close
        channel.set_ready(Ready::HANGUP);
        channel.handle_event(Timestamp::now());
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn orphaned_channel_drops_events() {
        let event_loop = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::new(&event_loop, a.as_raw_fd());
        {
            let handler = Arc::new(CountingHandler {
                reads: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            });
            let weak: Weak<dyn EventHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn EventHandler>));
            channel.set_handler(weak);
            // handler dropped here
        }
        channel.set_ready(Ready::READABLE);
        // must not panic, and must not dispatch anywhere
        channel.handle_event(Timestamp::now());
    }
}
