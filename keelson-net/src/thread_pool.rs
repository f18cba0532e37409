//! Loop-per-thread spawning and round-robin distribution.
//!
//! `EventLoopThread` runs one loop on one spawned thread and hands the loop
//! handle back through a bounded channel before polling starts.
//! `EventLoopThreadPool` owns N of them and deals loops out round-robin;
//! with zero threads everything runs on the base loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

/// One OS thread running one event loop.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    loop_: Mutex<Option<Arc<EventLoop>>>,
}

impl EventLoopThread {
    #[must_use]
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        Self {
            name: name.into(),
            init,
            thread: None,
            loop_: Mutex::new(None),
        }
    }

    /// Spawn the thread and block until its loop exists and is about to
    /// poll. Returns the running loop's handle.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.thread.is_none(), "loop thread already started");
        let (tx, rx) = flume::bounded(1);
        let init = self.init.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let lp = EventLoop::new();
                if let Some(init) = &init {
                    init(&lp);
                }
                tx.send(lp.clone()).expect("loop handshake receiver gone");
                lp.run();
                debug!("loop thread finished");
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(handle);

        let lp = rx.recv().expect("loop thread died during startup");
        *self.lock() = Some(lp.clone());
        lp
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<EventLoop>>> {
        self.loop_.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(lp) = self.lock().take() {
            lp.quit();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }
}

/// Fixed pool of worker loops fed round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    #[must_use]
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Number of worker threads to spawn at `start`. Zero keeps all work on
    /// the base loop.
    pub fn set_thread_num(&self, n: usize) {
        self.num_threads.store(n, Ordering::Release);
    }

    /// Spawn the workers. Base-loop thread only, at most once.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        self.base_loop.assert_in_loop_thread();
        assert!(!self.started.swap(true, Ordering::SeqCst), "pool started twice");

        let n = self.num_threads.load(Ordering::Acquire);
        debug!(name = %self.name, workers = n, "starting loop pool");
        let mut threads = self.lock_threads();
        let mut loops = self.lock_loops();
        for i in 0..n {
            let mut t = EventLoopThread::new(format!("{}{i}", self.name), init.clone());
            loops.push(t.start_loop());
            threads.push(t);
        }
        if n == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
    }

    /// Next worker loop, round-robin; the base loop when the pool is empty.
    /// Base-loop thread only.
    #[must_use]
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire));
        let loops = self.lock_loops();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[idx].clone()
        }
    }

    /// Every loop in the pool (the base loop when no workers exist).
    #[must_use]
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire));
        let loops = self.lock_loops();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<EventLoopThread>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_loops(&self) -> MutexGuard<'_, Vec<Arc<EventLoop>>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
