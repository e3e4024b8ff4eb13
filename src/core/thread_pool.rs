use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::{Lap, Shared, WorkerHook, MAX_WORKERS};
use super::job::JobRef;
use super::sync::{Arc, Mutex, thread::JoinHandle};
use super::shutdown::{Shutdown, ShutdownHandle};
use crate::error::PoolError;

/// A set of persistent worker threads, each owning a work-stealing queue.
///
/// Work is submitted in cycles: `preload` waits for every worker to be idle and
/// returns a `Preload` handle through which jobs are pushed into the workers' queues,
/// then `Preload::release` wakes the workers up. Each released worker executes the jobs
/// of its own queue, steals from the others until everything is empty and goes back
/// to sleep.
///
/// The pool is explicitly owned. Dropping it shuts it down and waits for the worker
/// threads to terminate.
pub struct WorkerPool {
    pub(crate) shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4)
            .min(MAX_WORKERS);

        WorkerPoolBuilder {
            num_threads,
            queue_capacity: 64,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    pub(crate) fn from_parts(shared: Arc<Shared>, threads: Vec<JoinHandle<()>>) -> Self {
        WorkerPool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// The initial capacity of each worker queue (always a power of two).
    ///
    /// Queues grow during the pre-load phase if needed.
    pub fn queue_capacity(&self) -> usize { self.shared.queue_capacity }

    /// Whether all workers are asleep with nothing left to do.
    pub fn is_idle(&self) -> bool {
        self.shared.sleep.all_idle()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_requested()
    }

    /// Block until every worker is idle or `timeout` expires.
    ///
    /// Returns whether the workers are idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        profiling::scope!("wait idle");
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.is_idle() {
                return true;
            }

            if self.is_shut_down() || Instant::now() >= deadline {
                return false;
            }

            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Begin the pre-load phase of a dispatch cycle.
    ///
    /// Waits up to `timeout` for all workers to go idle. Once they are, no thread other
    /// than the holder of the returned handle accesses the queues until
    /// `Preload::release` is called.
    pub fn preload(&mut self, timeout: Duration) -> Result<Preload<'_>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        if !self.wait_idle(timeout) {
            if self.is_shut_down() {
                return Err(PoolError::ShutDown);
            }

            return Err(PoolError::Busy(timeout));
        }

        for queue in &self.shared.queues {
            queue.close_to_thieves();
        }

        Ok(Preload { pool: self, released: false })
    }

    /// Attempt to steal one job from any of the worker queues.
    ///
    /// Meant for threads outside of the pool that want to keep busy while waiting for
    /// the workers. Gives up after a bounded number of contended attempts.
    pub fn steal_one(&self, start: usize) -> Option<JobRef> {
        let backoff = Backoff::new();
        loop {
            match self.shared.steal_lap(None, start) {
                Lap::Stolen(job) => return Some(job),
                Lap::Empty => return None,
                Lap::Contended => {
                    if backoff.is_completed() {
                        return None;
                    }
                    backoff.spin();
                }
            }
        }
    }

    /// A snapshot of each worker's counters.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.shared.counters.iter().map(|counters| counters.snapshot()).collect()
    }

    /// Start shutting the pool down.
    ///
    /// Does not block, call `ShutdownHandle::wait` to wait for the worker threads to
    /// terminate. Jobs still sitting in the queues are dropped without being executed.
    pub fn shut_down(&self) -> ShutdownHandle {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        Shutdown::request(&self.shared);

        ShutdownHandle::new(self.shared.clone(), threads)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shut_down().wait();
    }
}

/// Exclusive access to the worker queues while all workers are idle.
///
/// Obtained from `WorkerPool::preload`. Jobs can only be enqueued through this handle,
/// which guarantees that no worker is looking at the queues, so they are free to grow.
pub struct Preload<'p> {
    pool: &'p mut WorkerPool,
    released: bool,
}

impl<'p> Preload<'p> {
    pub fn num_worker_threads(&self) -> u32 { self.pool.num_worker_threads() }

    /// Add a job to the queue of worker `thread_index`.
    ///
    /// Jobs enqueued on a given worker are executed by that worker in insertion order
    /// unless they get stolen first. Thieves take them starting from the last one.
    pub fn enqueue_task(&mut self, thread_index: usize, job: JobRef) {
        let queue = &self.pool.shared.queues[thread_index];
        // Safety: all workers are idle and the pool is mutably borrowed, so we are
        // the only thread accessing the queues.
        unsafe {
            queue.push_at_top(job);
        }
    }

    /// Number of jobs currently waiting in a worker's queue.
    pub fn queue_len(&self, thread_index: usize) -> usize {
        self.pool.shared.queues[thread_index].len()
    }

    /// End the pre-load phase and wake up the first `num_threads` workers.
    ///
    /// Workers that are not woken up keep their jobs in their queue until they get
    /// stolen by the others.
    pub fn release(mut self, num_threads: u32) {
        self.release_impl(num_threads);
    }

    fn release_impl(&mut self, num_threads: u32) {
        self.released = true;
        let shared = &self.pool.shared;
        for queue in &shared.queues {
            queue.open_to_thieves();
        }

        log::trace!("Releasing {num_threads} of {} workers", shared.num_workers);
        shared.sleep.release(num_threads);
    }
}

impl<'p> Drop for Preload<'p> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pending: usize = self.pool.shared.queues.iter().map(|queue| queue.len()).sum();
        if pending > 0 {
            // Never leave jobs behind.
            log::warn!("Pre-load phase dropped with {pending} pending jobs, releasing all workers");
            self.release_impl(self.pool.num_worker_threads());
        } else {
            for queue in &self.pool.shared.queues {
                queue.open_to_thieves();
            }
        }
    }
}

/// Counters of a single worker thread.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// number of jobs executed.
    pub jobs_executed: u64,
    /// number of jobs taken from another worker's queue.
    pub steals: u64,
    /// Number of stealing laps that lost all their races.
    pub aborted_steals: u64,
    /// How many times the worker went to sleep.
    pub parks: u64,
}

pub struct WorkerPoolBuilder {
    pub(crate) num_threads: u32,
    pub(crate) queue_capacity: usize,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl WorkerPoolBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// The number of worker threads. Must be between 1 and `MAX_WORKERS`, which `build`
    /// checks.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;

        self
    }

    /// Initial capacity of each worker's queue, rounded up to a power of two.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        crate::core::init(self)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::core::job::{Chunk, Job};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn chunk(start: usize, end: usize, index: usize) -> Chunk {
        Chunk { start, end, index, cycle: 1 }
    }

    #[test]
    fn invalid_thread_count() {
        assert!(matches!(
            WorkerPool::builder().with_worker_threads(0).build(),
            Err(PoolError::InvalidThreadCount(0))
        ));
        assert!(matches!(
            WorkerPool::builder().with_worker_threads(MAX_WORKERS + 1).build(),
            Err(PoolError::InvalidThreadCount(_))
        ));
    }

    #[test]
    fn queue_capacity_is_rounded() {
        let pool = WorkerPool::builder()
            .with_worker_threads(2)
            .with_queue_capacity(100)
            .build()
            .unwrap();

        assert_eq!(pool.queue_capacity(), 128);
        assert_eq!(pool.num_worker_threads(), 2);
        assert!(!pool.is_shut_down());
    }

    #[test]
    fn preload_and_release() {
        let mut pool = WorkerPool::builder()
            .with_worker_threads(4)
            .with_queue_capacity(2)
            .build()
            .unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let job: Arc<dyn Job> = Arc::new(move |chunk: Chunk, thread_index: usize| {
            assert!(thread_index < 4);
            counter.fetch_add(chunk.len(), Ordering::SeqCst);
        });

        for _ in 0..50 {
            executed.store(0, Ordering::SeqCst);

            let mut preload = pool.preload(Duration::from_secs(5)).unwrap();
            // More jobs than the initial queue capacity, queues have to grow.
            for i in 0..40 {
                preload.enqueue_task(i % 4, JobRef::new(job.clone(), chunk(i * 10, i * 10 + 10, i)));
            }
            assert_eq!(preload.queue_len(0), 10);
            preload.release(4);

            assert!(pool.wait_idle(Duration::from_secs(5)));
            assert_eq!(executed.load(Ordering::SeqCst), 400);
        }

        let stats = pool.stats();
        let jobs: u64 = stats.iter().map(|s| s.jobs_executed).sum();
        assert_eq!(jobs, 50 * 40);
    }

    #[test]
    fn released_workers_steal_from_sleeping_ones() {
        let mut pool = WorkerPool::builder().with_worker_threads(3).build().unwrap();

        let executed_by = Arc::new(Mutex::new(Vec::new()));
        let log = executed_by.clone();
        let job: Arc<dyn Job> = Arc::new(move |chunk: Chunk, thread_index: usize| {
            log.lock().unwrap().push((chunk.index, thread_index));
        });

        let mut preload = pool.preload(Duration::from_secs(5)).unwrap();
        for i in 0..8 {
            // Everything goes to worker 2, which is not released.
            preload.enqueue_task(2, JobRef::new(job.clone(), chunk(i, i + 1, i)));
        }
        preload.release(1);

        assert!(pool.wait_idle(Duration::from_secs(5)));

        let executed_by = executed_by.lock().unwrap();
        assert_eq!(executed_by.len(), 8);
        for &(_, thread_index) in executed_by.iter() {
            assert_eq!(thread_index, 0);
        }
        // Thieves take from the top, so the last enqueued job is executed first.
        assert_eq!(executed_by[0].0, 7);
    }

    #[test]
    fn dropped_preload_releases_pending_jobs() {
        let mut pool = WorkerPool::builder().with_worker_threads(2).build().unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let job: Arc<dyn Job> = Arc::new(move |_: Chunk, _: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let mut preload = pool.preload(Duration::from_secs(5)).unwrap();
            preload.enqueue_task(1, JobRef::new(job.clone(), chunk(0, 1, 0)));
        }

        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let mut pool = WorkerPool::builder().with_worker_threads(1).build().unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let job: Arc<dyn Job> = Arc::new(move |chunk: Chunk, _: usize| {
            if chunk.index == 0 {
                panic!("boom");
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            let mut preload = pool.preload(Duration::from_secs(5)).unwrap();
            preload.enqueue_task(0, JobRef::new(job.clone(), chunk(0, 1, 0)));
            preload.enqueue_task(0, JobRef::new(job.clone(), chunk(1, 2, 1)));
            preload.release(1);
        }

        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(executed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn busy_pool_refuses_preload() {
        let mut pool = WorkerPool::builder().with_worker_threads(1).build().unwrap();

        let gate = Arc::new(AtomicU32::new(0));
        let gate2 = gate.clone();
        let job: Arc<dyn Job> = Arc::new(move |_: Chunk, _: usize| {
            while gate2.load(Ordering::Acquire) == 0 {
                std::thread::yield_now();
            }
        });

        let mut preload = pool.preload(Duration::from_secs(5)).unwrap();
        preload.enqueue_task(0, JobRef::new(job, chunk(0, 1, 0)));
        preload.release(1);

        assert!(matches!(
            pool.preload(Duration::from_millis(20)),
            Err(PoolError::Busy(_))
        ));

        gate.store(1, Ordering::Release);
        assert!(pool.preload(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn preload_after_shutdown() {
        let mut pool = WorkerPool::builder().with_worker_threads(2).build().unwrap();
        pool.shut_down().wait();

        assert!(pool.is_shut_down());
        assert!(matches!(pool.preload(Duration::from_millis(10)), Err(PoolError::ShutDown)));
    }
}
