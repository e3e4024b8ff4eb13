//! Completion signals and the shared wake-up used while waiting on them.
//!
//! A completion signal is reset before its chunk is dispatched and set by the thread
//! that finishes the chunk. Rather than a boolean, a signal stores the number of the
//! last cycle that completed it. Waiting for cycle `n` means waiting for the stamp to
//! be `n`, so a chunk of an earlier cycle that finishes late can't be mistaken for the
//! current one.

use std::time::Instant;

use crossbeam_utils::CachePadded;

use crate::core::sync::{fence, AtomicU32, AtomicU64, Condvar, Mutex, Ordering};

// Cycle numbers start at one.
const NOT_DONE: u64 = 0;

/// Wakes up a thread waiting for something to happen on other threads.
///
/// Notifying is cheap when nobody is waiting (a fence and an atomic load). Waiters
/// re-check their condition after registering, so a notification can't be missed
/// between the check and the wait.
pub struct WakeSignal {
    generation: AtomicU64,
    waiters: AtomicU32,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        WakeSignal {
            generation: AtomicU64::new(0),
            waiters: AtomicU32::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake the waiting threads up, if any.
    ///
    /// Whatever the notifying thread wrote before calling this is visible to the
    /// waiters' condition.
    pub fn notify(&self) {
        // Order the caller's writes before the read of `waiters`. Pairs with the fence
        // in `wait_until`.
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::Relaxed) == 0 {
            return;
        }

        let _guard = self.mutex.lock().unwrap();
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
    }

    /// Block until `ready` returns true or the deadline expires.
    ///
    /// Returns the last value returned by `ready`.
    pub fn wait_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> bool {
        loop {
            if ready() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            self.waiters.fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let seen = self.generation.load(Ordering::Relaxed);

            if ready() {
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                return true;
            }

            {
                profiling::scope!("wait(condvar)");
                let mut guard = self.mutex.lock().unwrap();
                while self.generation.load(Ordering::Relaxed) == seen {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    guard = self.cond.wait_timeout(guard, deadline - now).unwrap().0;
                }
            }

            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self { WakeSignal::new() }
}

/// A fixed set of completion signals sharing one wake-up.
pub struct CompletionSignals {
    stamps: Vec<CachePadded<AtomicU64>>,
    wake: WakeSignal,
}

impl CompletionSignals {
    pub fn new(count: usize) -> Self {
        CompletionSignals {
            stamps: (0..count).map(|_| CachePadded::new(AtomicU64::new(NOT_DONE))).collect(),
            wake: WakeSignal::new(),
        }
    }

    pub fn num_signals(&self) -> usize { self.stamps.len() }

    /// Must be called before the chunk guarded by this signal is dispatched.
    pub fn reset(&self, index: usize) {
        self.stamps[index].store(NOT_DONE, Ordering::Release);
    }

    /// Mark chunk `index` of `cycle` as done and wake the waiting thread up.
    pub fn set(&self, index: usize, cycle: u64) {
        debug_assert!(cycle != NOT_DONE);
        self.stamps[index].store(cycle, Ordering::Release);
        self.wake.notify();
    }

    pub fn is_set(&self, index: usize, cycle: u64) -> bool {
        self.stamps[index].load(Ordering::Acquire) == cycle
    }

    /// Whether all signals in `indices` are set for `cycle`.
    pub fn all_set(&self, indices: std::ops::Range<usize>, cycle: u64) -> bool {
        indices.into_iter().all(|index| self.is_set(index, cycle))
    }

    /// The wake-up notified each time a signal is set. Workers also notify it to report
    /// progress in split mode.
    pub fn wake(&self) -> &WakeSignal { &self.wake }

    /// Block until the signals of `indices` are all set for `cycle`, or the deadline
    /// expires. Returns whether they are all set.
    pub fn wait_all(&self, indices: std::ops::Range<usize>, cycle: u64, deadline: Instant) -> bool {
        profiling::scope!("wait completion");
        self.wake.wait_until(deadline, || self.all_set(indices.clone(), cycle))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stale_stamps_are_not_done() {
        let signals = CompletionSignals::new(3);
        signals.set(0, 1);
        signals.set(1, 1);
        signals.set(2, 1);
        assert!(signals.all_set(0..3, 1));

        // Next cycle: a late signal from cycle 1 doesn't count.
        for i in 0..3 {
            signals.reset(i);
        }
        signals.set(1, 1);
        assert!(!signals.is_set(1, 2));
        signals.set(0, 2);
        assert!(signals.is_set(0, 2));
        assert!(!signals.all_set(0..3, 2));
    }

    #[test]
    fn wait_times_out() {
        let signals = CompletionSignals::new(1);
        signals.reset(0);
        let start = Instant::now();
        assert!(!signals.wait_all(0..1, 7, start + Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_for_other_threads() {
        for _ in 0..100 {
            let signals = Arc::new(CompletionSignals::new(4));
            let threads: Vec<_> = (0..4).map(|i| {
                let signals = signals.clone();
                std::thread::spawn(move || signals.set(i, 3))
            }).collect();

            assert!(signals.wait_all(0..4, 3, Instant::now() + Duration::from_secs(10)));

            for thread in threads {
                thread.join().unwrap();
            }
        }
    }
}
