//! Whole-pool shutdown.
//!
//! A flag tells the workers to leave their loop. Each of them decrements a counter on
//! the way out, and `ShutdownHandle::wait` blocks until the counter reaches zero before
//! joining the threads. The flag is never cleared: a pool that was shut down stays shut
//! down.

use crate::core::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc, thread::JoinHandle};

use crate::core::Shared;

pub(crate) struct Shutdown {
    requested: AtomicBool,
    remaining_workers: Mutex<u32>,
    all_exited: Condvar,
}

impl Shutdown {
    pub fn new(num_workers: u32) -> Self {
        Shutdown {
            requested: AtomicBool::new(false),
            remaining_workers: Mutex::new(num_workers),
            all_exited: Condvar::new(),
        }
    }

    /// Raise the flag and wake every worker so that it notices.
    pub fn request(shared: &Shared) {
        if !shared.shutdown.requested.swap(true, Ordering::SeqCst) {
            log::debug!("Shutting down {} worker threads", shared.num_workers);
        }

        shared.sleep.wake_all();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Called by each worker thread right before it returns.
    pub fn worker_exited(&self) {
        let mut remaining = self.remaining_workers.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.all_exited.notify_all();
        }
    }

    fn wait_for_workers(&self) {
        let mut remaining = self.remaining_workers.lock().unwrap();
        while *remaining > 0 {
            remaining = self.all_exited.wait(remaining).unwrap();
        }
    }
}

/// Returned by `WorkerPool::shut_down`.
pub struct ShutdownHandle {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ShutdownHandle {
    pub(crate) fn new(shared: Arc<Shared>, threads: Vec<JoinHandle<()>>) -> Self {
        ShutdownHandle { shared, threads }
    }

    /// Block until all worker threads have terminated.
    ///
    /// Only the first handle of a pool holds the threads. Waiting on the others returns
    /// once the workers have left their loop.
    pub fn wait(self) {
        self.shared.shutdown.wait_for_workers();
        for thread in self.threads {
            if thread.join().is_err() {
                log::error!("A worker thread panicked while exiting");
            }
        }
    }
}

#[cfg(not(loom))]
#[test]
fn shut_down_runs_the_hooks() {
    use std::sync::atomic::AtomicU32;
    use crate::WorkerPool;
    static STARTED: AtomicU32 = AtomicU32::new(0);
    static EXITED: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in 1..17 {
            STARTED.store(0, Ordering::SeqCst);
            EXITED.store(0, Ordering::SeqCst);

            let pool = WorkerPool::builder()
                .with_worker_threads(num_threads)
                .with_start_handler(|_id| { STARTED.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { EXITED.fetch_add(1, Ordering::SeqCst); })
                .build()
                .unwrap();

            let handle = pool.shut_down();
            assert!(pool.is_shut_down());
            handle.wait();

            assert_eq!(STARTED.load(Ordering::SeqCst), num_threads);
            assert_eq!(EXITED.load(Ordering::SeqCst), num_threads);

            // Shutting down again is harmless.
            pool.shut_down().wait();
        }
    }
}

#[cfg(not(loom))]
#[test]
fn drop_shuts_down() {
    use std::sync::atomic::AtomicU32;
    use crate::WorkerPool;
    static EXITED: AtomicU32 = AtomicU32::new(0);

    {
        let _pool = WorkerPool::builder()
            .with_worker_threads(3)
            .with_exit_handler(|_id| { EXITED.fetch_add(1, Ordering::SeqCst); })
            .build()
            .unwrap();
    }

    assert_eq!(EXITED.load(Ordering::SeqCst), 3);
}
