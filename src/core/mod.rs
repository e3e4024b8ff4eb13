pub mod job;
pub mod deque;
pub mod ring_buffer;
pub mod thread_pool;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use std::panic::{self, AssertUnwindSafe};

use crossbeam_utils::{Backoff, CachePadded, sync::{Parker, Unparker}};

use sync::{Arc, Ordering, AtomicU64, thread};
use deque::{Steal, WorkStealingDeque};
use job::JobRef;
use thread_pool::{WorkerPool, WorkerPoolBuilder, WorkerStats};
use shutdown::Shutdown;
use crate::error::PoolError;

/// The maximum number of worker threads in a pool.
///
/// Worker states are packed into the bits of a single 64 bits atomic.
pub const MAX_WORKERS: u32 = 64;

/// Data accessible by the pool and all of its worker threads.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Capacity the queues were created with.
    pub queue_capacity: usize,
    /// One queue per worker. Worker `i` is the owner of `queues[i]`, except during the
    /// pre-load phase where the thread holding the `Preload` handle acts as the owner.
    pub queues: Vec<CachePadded<WorkStealingDeque<JobRef>>>,
    /// State and logic to put worker threads to sleep and wake them up.
    pub sleep: Sleep,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    /// Per-worker counters, mostly for debugging and tuning.
    pub counters: Vec<CachePadded<WorkerCounters>>,
    // A few hooks to register work
    handlers: WorkerHooks,
}

pub(crate) fn init(params: WorkerPoolBuilder) -> Result<WorkerPool, PoolError> {
    let num_threads = params.num_threads;
    if num_threads == 0 || num_threads > MAX_WORKERS {
        return Err(PoolError::InvalidThreadCount(num_threads));
    }

    let queue_capacity = params.queue_capacity.max(2).next_power_of_two();

    let mut queues = Vec::with_capacity(num_threads as usize);
    let mut counters = Vec::with_capacity(num_threads as usize);
    for _ in 0..num_threads {
        queues.push(CachePadded::new(WorkStealingDeque::new(queue_capacity)));
        counters.push(CachePadded::new(WorkerCounters::default()));
    }

    let (sleep, mut parkers) = Sleep::new(num_threads as usize);

    let shared = Arc::new(Shared {
        num_workers: num_threads,
        queue_capacity,
        queues,
        sleep,
        shutdown: Shutdown::new(num_threads),
        counters,
        handlers: WorkerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    let mut threads = Vec::with_capacity(num_threads as usize);
    for i in 0..num_threads {
        let worker = Worker {
            index: i as usize,
            shared: shared.clone(),
            parker: parkers[i as usize].take().unwrap(),
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        });

        match spawned {
            Ok(handle) => threads.push(handle),
            Err(source) => {
                log::error!("Failed to spawn worker thread #{i}: {source}");
                // Tear down the workers we already started. The ones that were never
                // spawned won't report back, so join the handles instead of waiting
                // on the shutdown counter.
                Shutdown::request(&shared);
                for handle in threads {
                    let _ = handle.join();
                }

                return Err(PoolError::Spawn { index: i, source });
            }
        }
    }

    log::debug!("Started a worker pool with {num_threads} threads (queue capacity {queue_capacity})");

    Ok(WorkerPool::from_parts(shared, threads))
}

/// Outcome of one round-robin pass over the queues.
pub(crate) enum Lap {
    Stolen(JobRef),
    /// Nothing was stolen but at least one attempt lost a race, so there may be
    /// work left.
    Contended,
    Empty,
}

impl Shared {
    /// Try each queue once starting at `start`, skipping the thief's own queue, and
    /// return the first job we manage to steal.
    pub fn steal_lap(&self, thief: Option<usize>, start: usize) -> Lap {
        let num_queues = self.queues.len();
        let mut contended = false;
        for offset in 0..num_queues {
            let idx = (start + offset) % num_queues;
            if Some(idx) == thief {
                continue;
            }

            match self.queues[idx].steal() {
                Steal::Success(job) => {
                    return Lap::Stolen(job);
                }
                Steal::Aborted => {
                    // Someone else got it. Don't insist on this queue.
                    contended = true;
                }
                Steal::Empty => {}
            }
        }

        if contended { Lap::Contended } else { Lap::Empty }
    }
}

/// Idle state of the worker threads and the means to wake them up.
///
/// A worker whose idle bit is set is either parked or about to park, and is guaranteed
/// not to touch any queue until its bit is cleared by `release`. This is what lets the
/// pre-load phase fill the queues without synchronizing with the workers.
pub(crate) struct Sleep {
    /// Atomic bitfield. Setting the Nth bit to one means the Nth worker thread is idle.
    idle_workers: AtomicU64,
    all_workers: u64,
    unparkers: Vec<CachePadded<Unparker>>,
}

impl Sleep {
    fn new(num_threads: usize) -> (Self, Vec<Option<Parker>>) {
        let mut parkers = Vec::with_capacity(num_threads);
        let mut unparkers = Vec::with_capacity(num_threads);

        for _ in 0..num_threads {
            let parker = Parker::new();
            unparkers.push(CachePadded::new(parker.unparker().clone()));
            parkers.push(Some(parker));
        }

        let all_workers = if num_threads as u32 >= MAX_WORKERS {
            !0
        } else {
            (1u64 << num_threads) - 1
        };

        (
            Sleep {
                // Workers start idle and wait for the first release.
                idle_workers: AtomicU64::new(all_workers),
                all_workers,
                unparkers,
            },
            parkers,
        )
    }

    /// Wake up the first `n` workers.
    ///
    /// Clearing the idle bit before unparking is what hands the queues over to the
    /// worker threads.
    pub fn release(&self, n: u32) {
        profiling::scope!("release workers");
        let n = (n as usize).min(self.unparkers.len());
        for i in 0..n {
            let bit = 1u64 << i;
            let prev = self.idle_workers.fetch_and(!bit, Ordering::AcqRel);
            if prev & bit != 0 {
                self.unparkers[i].unpark();
            }
        }
    }

    fn mark_idle(&self, worker: usize) {
        self.idle_workers.fetch_or(1u64 << worker, Ordering::AcqRel);
    }

    fn is_idle(&self, worker: usize) -> bool {
        self.idle_workers.load(Ordering::Acquire) & (1u64 << worker) != 0
    }

    /// Whether every worker is parked (or about to be) with nothing left to do.
    pub fn all_idle(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) & self.all_workers == self.all_workers
    }

    /// Wake all workers.
    ///
    /// Only intended for the shutdown code: the idle bits are left untouched so the
    /// workers go right back to sleep unless they are shutting down.
    pub fn wake_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkerCounters {
    jobs_executed: AtomicU64,
    steals: AtomicU64,
    aborted_steals: AtomicU64,
    parks: AtomicU64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            aborted_steals: self.aborted_steals.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Worker {
    index: usize,
    shared: Arc<Shared>,
    parker: Parker,
}

impl Worker {
    fn run(&self) {
        let shared = &*self.shared;

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index as u32);
        }

        loop {
            // Wait until we are released or the pool shuts down. The idle bit is
            // checked in a loop in case the parker lets us through early.
            while shared.sleep.is_idle(self.index) && !shared.shutdown.is_requested() {
                WorkerCounters::bump(&shared.counters[self.index].parks);
                self.parker.park();
            }

            if shared.shutdown.is_requested() {
                break;
            }

            self.drain();

            // Every queue was observed empty. From here on we must not touch the queues
            // until the next release.
            shared.sleep.mark_idle(self.index);
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index as u32);
        }

        shared.shutdown.worker_exited();
    }

    // Execute jobs from our own queue, then from the other queues, until a full lap
    // doesn't find anything.
    fn drain(&self) {
        profiling::scope!("drain");
        let shared = &*self.shared;
        let queue = &shared.queues[self.index];
        let counters = &shared.counters[self.index];
        let first_victim = (self.index + 1) % shared.queues.len();

        'main: loop {
            // First see if we have work to do in our own queue.
            // Safety: we are the owner of this queue while our idle bit is cleared.
            while let Some(job) = unsafe { queue.pop() } {
                self.execute(job);
            }

            // See if there is work we can steal from other workers.
            let backoff = Backoff::new();
            loop {
                match shared.steal_lap(Some(self.index), first_victim) {
                    Lap::Stolen(job) => {
                        WorkerCounters::bump(&counters.steals);
                        self.execute(job);

                        // If we found anything to do via work-stealing, go back to checking
                        // the local queue again.
                        continue 'main;
                    }
                    Lap::Contended => {
                        WorkerCounters::bump(&counters.aborted_steals);
                        backoff.snooze();
                    }
                    Lap::Empty => {
                        return;
                    }
                }
            }
        }
    }

    fn execute(&self, job: JobRef) {
        profiling::scope!("job");
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute(self.index)));
        if result.is_err() {
            // Jobs are expected to deal with their own failures. A panic that escapes a
            // job must not take the worker thread down with it.
            log::error!("Worker #{}: a job panicked while processing {:?}", self.index, job.chunk());
        }

        WorkerCounters::bump(&self.shared.counters[self.index].jobs_executed);
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
