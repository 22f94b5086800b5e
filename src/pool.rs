//! Worker threads that each own an event loop, and the round-robin pool
//! the server draws from.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::ThreadInitCallback;
use crate::event_loop::EventLoop;

struct LoopThreadShared {
    event_loop: Mutex<Option<EventLoop>>,
    published: Condvar,
}

/// One worker thread hosting one event loop.
///
/// The loop is constructed *inside* the worker thread (so that thread owns
/// it), published back through a condvar, and then run until quit. Dropping
/// the handle quits the loop and joins the thread.
pub struct LoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    shared: Arc<LoopThreadShared>,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> LoopThread {
        LoopThread {
            name: name.into(),
            init,
            shared: Arc::new(LoopThreadShared {
                event_loop: Mutex::new(None),
                published: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Spawn the worker and block until its loop handle is published.
    pub fn start_loop(&mut self) -> EventLoop {
        let shared = self.shared.clone();
        let init = self.init.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new().expect("failed to create event loop");
                if let Some(init) = &init {
                    init(&event_loop);
                }
                {
                    let mut slot = shared.event_loop.lock().unwrap();
                    *slot = Some(event_loop.clone());
                    shared.published.notify_one();
                }
                event_loop.run();
                *shared.event_loop.lock().unwrap() = None;
            })
            .expect("failed to spawn loop thread");
        self.handle = Some(handle);

        let mut slot = self.shared.event_loop.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.published.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        let event_loop = self.shared.event_loop.lock().unwrap().clone();
        if let Some(event_loop) = event_loop {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Pool of worker loops fed by round-robin dispatch.
///
/// With zero workers everything, including new connections, stays on the
/// base loop.
pub struct LoopPool {
    base_loop: EventLoop,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<EventLoop>>,
}

impl LoopPool {
    pub fn new(base_loop: EventLoop, name: impl Into<String>) -> LoopPool {
        LoopPool {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Configure the worker count. Must happen before [`start`](Self::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "pool is already started"
        );
        self.num_threads.store(num_threads, Ordering::SeqCst);
    }

    /// Spawn the workers and collect their loops. With zero workers the
    /// init callback runs once on the base loop instead.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        self.base_loop.assert_in_loop_thread();
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "pool is already started"
        );

        let num_threads = self.num_threads.load(Ordering::SeqCst);
        info!(name = %self.name, workers = num_threads, "starting loop pool");

        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let mut loop_thread =
                LoopThread::new(format!("{}-{}", self.name, i), init.clone());
            loops.push(loop_thread.start_loop());
            threads.push(loop_thread);
        }

        if num_threads == 0 && let Some(init) = &init {
            init(&self.base_loop);
        }
    }

    /// Pick the loop for the next connection: base loop if there are no
    /// workers, else plain round-robin.
    pub fn next_loop(&self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        debug!(name = %self.name, index, "dispatching to worker loop");
        loops[index].clone()
    }

    /// All worker loops, or the base loop if there are none.
    pub fn all_loops(&self) -> Vec<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
