//! The reactor loop: poll, dispatch, drain queued tasks.
//!
//! One `EventLoop` is owned by exactly one thread — the thread that
//! constructed it — and only that thread may run it or touch its channel
//! table. Any other thread interacts through [`run_in_loop`] /
//! [`queue_in_loop`], which marshal closures onto the owning thread and
//! kick the loop out of its poll via an eventfd.
//!
//! [`run_in_loop`]: EventLoop::run_in_loop
//! [`queue_in_loop`]: EventLoop::queue_in_loop

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, error, trace};

use crate::channel::{Channel, EventHandler};
use crate::metrics;
use crate::poller::Poller;
use crate::time::Timestamp;

/// How long one poll may block with nothing to do.
const POLL_TIMEOUT_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

/// Handle to an event loop. Cloning is cheap; all clones refer to the
/// same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

pub(crate) struct LoopInner {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    executing_tasks: AtomicBool,
    poll_return_micros: AtomicU64,
    wakeup_fd: OwnedFd,
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    // kept alive for the life of the loop; registered in the poller
    wakeup_channel: Mutex<Option<Arc<Channel>>>,
}

impl EventLoop {
    /// Create an event loop owned by the calling thread.
    ///
    /// Fails if the epoll instance or the wakeup descriptor cannot be
    /// created.
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(wakeup_fd) };

        let inner = Arc::new(LoopInner {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            executing_tasks: AtomicBool::new(false),
            poll_return_micros: AtomicU64::new(0),
            wakeup_fd,
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            wakeup_channel: Mutex::new(None),
        });

        let channel = Channel::from_loop_inner(&inner, inner.wakeup_fd.as_raw_fd());
        let handler: Weak<dyn EventHandler> =
            Arc::downgrade(&(inner.clone() as Arc<dyn EventHandler>));
        channel.set_handler(handler);
        *inner.wakeup_channel.lock().unwrap() = Some(channel.clone());
        channel.enable_reading();

        debug!(fd = inner.wakeup_fd.as_raw_fd(), "event loop created");
        Ok(EventLoop { inner })
    }

    /// Run the loop until [`quit`](Self::quit) is called.
    ///
    /// Each iteration polls for readiness (up to 10 s), dispatches every
    /// ready channel with the poll-return timestamp, then drains the
    /// cross-thread task queue.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.inner.looping.load(Ordering::SeqCst),
            "event loop is already running"
        );
        self.inner.looping.store(true, Ordering::SeqCst);
        debug!("event loop starts");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.inner.quit.load(Ordering::SeqCst) {
            active.clear();
            let ts = {
                let mut poller = self.inner.poller.lock().unwrap();
                poller.poll(POLL_TIMEOUT_MS, &mut active)
            };
            self.inner
                .poll_return_micros
                .store(ts.as_micros(), Ordering::SeqCst);

            for channel in &active {
                channel.handle_event(ts);
            }
            self.inner.run_pending_tasks();
        }

        debug!("event loop stops");
        self.inner.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to exit after the current iteration. Safe to call
    /// from any thread.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the owning thread: immediately if the caller already
    /// is that thread, otherwise via the task queue.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the queue and wake the loop if needed.
    ///
    /// The wakeup also fires when the owning thread enqueues from inside
    /// the drain: the loop is mid-drain and would otherwise go back to a
    /// full poll before noticing the new task.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let need_wake = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push(Box::new(task));
            !self.is_in_loop_thread() || self.inner.executing_tasks.load(Ordering::SeqCst)
        };
        if need_wake {
            self.wakeup();
        }
    }

    /// Force the poll to return by writing to the wakeup descriptor.
    pub fn wakeup(&self) {
        metrics::LOOP_WAKEUPS.increment();
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.inner.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup write was short");
        }
    }

    /// True if the calling thread owns this loop.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Panic unless called on the owning thread.
    #[inline]
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop-affine call from foreign thread {:?} (owner {:?})",
            thread::current().id(),
            self.inner.thread_id
        );
    }

    /// Wall-clock time at which the last poll returned.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.inner.poll_return_micros.load(Ordering::SeqCst))
    }

    /// Forward a channel's interest mask to the poller. Owning thread only.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.inner.update_channel(channel);
    }

    /// Drop a channel from the poller. Owning thread only.
    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.inner.remove_channel(channel);
    }

    /// True if the poller's table holds this channel.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.inner.has_channel(channel)
    }

    /// True if two handles refer to the same loop.
    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }
}

impl LoopInner {
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            thread::current().id() == self.thread_id,
            "loop-affine call from foreign thread {:?} (owner {:?})",
            thread::current().id(),
            self.thread_id
        );
    }

    /// Swap the queue out under the mutex, then execute without holding
    /// it, so tasks can enqueue further tasks freely. Anything enqueued
    /// during the drain runs on the next iteration, never this one.
    fn run_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.executing_tasks.store(true, Ordering::SeqCst);
        {
            let mut pending = self.pending.lock().unwrap();
            std::mem::swap(&mut tasks, &mut *pending);
        }
        let count = tasks.len();
        if count > 0 {
            trace!(count, "running pending tasks");
        }
        for task in tasks {
            task();
        }
        self.executing_tasks.store(false, Ordering::SeqCst);
    }
}

// Read side of the wakeup descriptor: drain the counter and discard. The
// useful effect already happened — the poll returned.
impl EventHandler for LoopInner {
    fn handle_read(&self, _ts: Timestamp) {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup read was short");
        }
    }
}
