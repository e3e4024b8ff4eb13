//! A Chase-Lev work-stealing deque.
//!
//! The owner of the deque pushes and pops at the bottom, any number of thieves take
//! items from the top. The uncontested paths don't take any lock, and contention over
//! the last item (or between thieves) is resolved with a single compare-and-swap on
//! `top`.
//!
//! Unlike the textbook version, the backing buffer is only allowed to grow while no
//! thief can observe the deque. This is the case during the pre-load phase of the
//! thread pool, where the deques are filled before any worker is released. It lets us
//! replace the buffer outright instead of keeping retired buffers alive until all
//! thieves are done with them.

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

use super::ring_buffer::RingBuffer;
use super::sync::{fence, AtomicBool, AtomicIsize, Ordering};
#[cfg(debug_assertions)]
use crate::util::ExclusiveCheck;

/// Outcome of `WorkStealingDeque::steal`.
///
/// `Aborted` means another thread won the race for the item we were looking at. It
/// is a normal outcome: the caller should move on to another deque or retry the whole
/// operation later, never spin on the same deque.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Steal<T> {
    Success(T),
    Aborted,
    Empty,
}

impl<T> Steal<T> {
    pub fn is_success(&self) -> bool { matches!(self, Steal::Success(_)) }

    pub fn is_aborted(&self) -> bool { matches!(self, Steal::Aborted) }

    pub fn is_empty(&self) -> bool { matches!(self, Steal::Empty) }

    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(item) => Some(item),
            Steal::Aborted | Steal::Empty => None,
        }
    }
}

pub struct WorkStealingDeque<T> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    buffer: UnsafeCell<RingBuffer<T>>,
    // Set while thieves may access the deque. Growing is forbidden while it is set.
    open: AtomicBool,
    #[cfg(debug_assertions)]
    owner: ExclusiveCheck<&'static str>,
}

unsafe impl<T: Send> Send for WorkStealingDeque<T> {}
unsafe impl<T: Send> Sync for WorkStealingDeque<T> {}

impl<T> WorkStealingDeque<T> {
    /// Creates an empty deque with room for at least `capacity - 1` items before it
    /// has to grow.
    pub fn new(capacity: usize) -> Self {
        WorkStealingDeque {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            buffer: UnsafeCell::new(RingBuffer::new(capacity)),
            open: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            owner: ExclusiveCheck::with_tag("work-stealing deque owner"),
        }
    }

    /// Capacity of the current buffer.
    ///
    /// Must not be called concurrently with an operation that may grow the deque.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.buffer.get()).capacity() }
    }

    /// Number of times the buffer was replaced by a larger one.
    ///
    /// Must not be called concurrently with an operation that may grow the deque.
    pub fn buffer_version(&self) -> u32 {
        unsafe { (*self.buffer.get()).version() }
    }

    /// Approximate number of items. Exact when no other thread touches the deque.
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);

        (bottom - top).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allow thieves in. From now on the buffer must not grow.
    pub fn open_to_thieves(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Declare that no thief can access the deque anymore, which allows growing it again.
    pub fn close_to_thieves(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open_to_thieves(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Push an item at the bottom of the deque.
    ///
    /// Unsafe: only the owner of the deque may call this, and never concurrently with
    /// another `push`, `push_at_top` or `pop`. If the deque is full it grows, which is
    /// only allowed while the deque is closed to thieves.
    pub unsafe fn push(&self, item: T) {
        #[cfg(debug_assertions)]
        self.owner.begin();

        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);

        let buffer = self.reserve(top, bottom);
        (*buffer).put(bottom, item);

        self.bottom.store(bottom + 1, Ordering::Release);

        #[cfg(debug_assertions)]
        self.owner.end();
    }

    /// Push an item at the top of the deque.
    ///
    /// A batch of items pushed this way is popped in insertion order, whereas `push`
    /// yields them in reverse order.
    ///
    /// Unsafe: only legal while the deque is closed to thieves, by the owner.
    pub unsafe fn push_at_top(&self, item: T) {
        debug_assert!(!self.is_open_to_thieves(), "push_at_top on a deque open to thieves");

        #[cfg(debug_assertions)]
        self.owner.begin();

        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);

        let buffer = self.reserve(top, bottom);
        (*buffer).put(top - 1, item);

        self.top.store(top - 1, Ordering::Release);

        #[cfg(debug_assertions)]
        self.owner.end();
    }

    /// Pop an item from the bottom of the deque.
    ///
    /// Unsafe: only the owner of the deque may call this, and never concurrently with
    /// another `push`, `push_at_top` or `pop`.
    pub unsafe fn pop(&self) -> Option<T> {
        #[cfg(debug_assertions)]
        self.owner.begin();

        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::Relaxed);

        // Publish the reservation of the bottom slot before looking at what the thieves did.
        fence(Ordering::SeqCst);

        let top = self.top.load(Ordering::Relaxed);
        let remaining = bottom - top;

        let result = if remaining < 0 {
            // Already empty, undo the reservation.
            self.bottom.store(top, Ordering::Relaxed);
            None
        } else {
            let item = (*self.buffer.get()).get(bottom);
            if remaining > 0 {
                // Thieves can't reach this slot.
                Some(item.assume_init())
            } else {
                // Last item: whoever moves top from `top` to `top + 1` gets it. Either we
                // did, or a thief did. In both cases top is now `top + 1` and the deque is
                // empty.
                let won = self.top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();

                self.bottom.store(top + 1, Ordering::Relaxed);

                if won { Some(item.assume_init()) } else { None }
            }
        };

        #[cfg(debug_assertions)]
        self.owner.end();

        result
    }

    /// Attempt to take the item at the top of the deque.
    ///
    /// Can be called from any thread.
    pub fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if bottom - top <= 0 {
            return Steal::Empty;
        }

        debug_assert!(self.is_open_to_thieves(), "steal from a deque closed to thieves");

        // Read before claiming the slot. If the claim fails the copy is dropped as a
        // `MaybeUninit`, without running the item's destructor.
        let item = unsafe { (*self.buffer.get()).get(top) };

        match self.top.compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => Steal::Success(unsafe { item.assume_init() }),
            Err(_) => Steal::Aborted,
        }
    }

    // Grow the buffer if `[top, bottom)` plus one more item would not fit.
    unsafe fn reserve(&self, top: isize, bottom: isize) -> *const RingBuffer<T> {
        let buffer = self.buffer.get();
        let capacity = (*buffer).capacity();
        if bottom - top >= capacity as isize - 1 {
            debug_assert!(!self.is_open_to_thieves(), "growing a deque that thieves can observe");

            let grown = (*buffer).grow(top, bottom, capacity * 2);
            // The old buffer's slots were moved into the new one, dropping it doesn't
            // drop any item.
            *buffer = grown;
        }

        buffer
    }
}

impl<T> Drop for WorkStealingDeque<T> {
    fn drop(&mut self) {
        let top = self.top.load(Ordering::Relaxed);
        let bottom = self.bottom.load(Ordering::Relaxed);
        let buffer = self.buffer.get_mut();
        for index in top..bottom {
            unsafe {
                drop(buffer.get(index).assume_init());
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn push_pop_is_lifo() {
        let deque = WorkStealingDeque::new(128);
        unsafe {
            for i in 0..100u32 {
                deque.push(i);
            }
            assert_eq!(deque.len(), 100);

            for i in (0..100u32).rev() {
                assert_eq!(deque.pop(), Some(i));
            }
            assert_eq!(deque.pop(), None);
            assert_eq!(deque.pop(), None);
        }
        assert!(deque.is_empty());
    }

    #[test]
    fn preload_pops_in_insertion_order() {
        let deque = WorkStealingDeque::new(16);
        unsafe {
            for i in 0..10u32 {
                deque.push_at_top(i);
            }
            for i in 0..10u32 {
                assert_eq!(deque.pop(), Some(i));
            }
            assert_eq!(deque.pop(), None);
        }
    }

    #[test]
    fn preload_steals_from_the_far_end() {
        let deque = WorkStealingDeque::new(16);
        unsafe {
            for i in 0..4u32 {
                deque.push_at_top(i);
            }
        }
        deque.open_to_thieves();

        assert_eq!(deque.steal(), Steal::Success(3));
        assert_eq!(unsafe { deque.pop() }, Some(0));
        assert_eq!(deque.steal(), Steal::Success(2));
        assert_eq!(unsafe { deque.pop() }, Some(1));
        assert_eq!(deque.steal(), Steal::Empty);
        assert_eq!(unsafe { deque.pop() }, None);
    }

    #[test]
    fn growth_preserves_order() {
        let initial_capacity = 8;
        let deque = WorkStealingDeque::new(initial_capacity);
        unsafe {
            for i in 0..(2 * initial_capacity as u32) {
                deque.push(i);
            }
            assert!(deque.capacity() > initial_capacity);
            assert!(deque.buffer_version() >= 1);

            for i in (0..(2 * initial_capacity as u32)).rev() {
                assert_eq!(deque.pop(), Some(i));
            }
            assert_eq!(deque.pop(), None);
        }
    }

    #[test]
    fn growth_during_preload() {
        let deque = WorkStealingDeque::new(4);
        unsafe {
            for i in 0..37u32 {
                deque.push_at_top(i);
            }
            assert_eq!(deque.len(), 37);
            assert_eq!(deque.capacity(), 64);
        }

        deque.open_to_thieves();
        for i in (20..37u32).rev() {
            assert_eq!(deque.steal(), Steal::Success(i));
        }
        unsafe {
            for i in 0..20u32 {
                assert_eq!(deque.pop(), Some(i));
            }
        }
        assert!(deque.steal().is_empty());
    }

    #[test]
    fn mixed_ends() {
        let deque = WorkStealingDeque::new(4);
        unsafe {
            deque.push_at_top(1u32);
            deque.push(2);
            deque.push_at_top(0);
            deque.push(3);

            // top -> bottom: 0 1 2 3
            assert_eq!(deque.pop(), Some(3));
            deque.open_to_thieves();
            assert_eq!(deque.steal(), Steal::Success(0));
            assert_eq!(deque.pop(), Some(2));
            assert_eq!(deque.pop(), Some(1));
            assert_eq!(deque.pop(), None);
        }
    }

    #[test]
    fn drop_releases_remaining_items() {
        let token = Arc::new(());
        {
            let deque = WorkStealingDeque::new(2);
            unsafe {
                for _ in 0..10 {
                    deque.push(token.clone());
                }
                for _ in 0..3 {
                    deque.push_at_top(token.clone());
                }
                drop(deque.pop());
            }
            deque.open_to_thieves();
            drop(deque.steal());
            assert_eq!(Arc::strong_count(&token), 12);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    // Items that the owner pushes back into the deque are tagged with this bit so that
    // each item is re-pushed at most once.
    const REPUSHED: usize = 1 << 40;

    fn concurrent_trial(num_items: usize, num_thieves: usize) {
        let deque = Arc::new(WorkStealingDeque::new(num_items * 2));
        unsafe {
            for i in 0..num_items {
                deque.push_at_top(i);
            }
        }
        deque.open_to_thieves();

        let owner_done = Arc::new(AtomicBool::new(false));
        let taken = Arc::new(Mutex::new(Vec::with_capacity(num_items)));

        let thieves: Vec<_> = (0..num_thieves).map(|_| {
            let deque = deque.clone();
            let owner_done = owner_done.clone();
            let taken = taken.clone();
            thread::spawn(move || {
                let mut local = Vec::new();
                loop {
                    match deque.steal() {
                        Steal::Success(item) => local.push(item & !REPUSHED),
                        Steal::Aborted => {}
                        Steal::Empty => {
                            if owner_done.load(std::sync::atomic::Ordering::Acquire) {
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                }
                taken.lock().unwrap().extend(local);
            })
        }).collect();

        let mut local = Vec::new();
        unsafe {
            while let Some(item) = deque.pop() {
                if item & REPUSHED == 0 && item % 2 == 0 {
                    deque.push(item | REPUSHED);
                } else {
                    local.push(item & !REPUSHED);
                }
            }
        }
        // Only the owner pushes, so once it sees the deque empty it stays empty.
        owner_done.store(true, std::sync::atomic::Ordering::Release);

        for thief in thieves {
            thief.join().unwrap();
        }

        let mut taken = Arc::try_unwrap(taken).unwrap().into_inner().unwrap();
        taken.extend(local);
        taken.sort_unstable();

        assert_eq!(taken.len(), num_items, "items lost or delivered twice");
        for (expected, item) in taken.into_iter().enumerate() {
            assert_eq!(item, expected);
        }
    }

    #[test]
    fn concurrent_steal_and_pop() {
        for _ in 0..100 {
            concurrent_trial(1000, 4);
        }
    }

    #[test]
    #[ignore]
    fn concurrent_steal_and_pop_stress() {
        for _ in 0..10_000 {
            concurrent_trial(10_000, 8);
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn loom_pop_and_steal_last_items() {
        loom::model(|| {
            let deque = Arc::new(WorkStealingDeque::new(4));
            unsafe {
                deque.push_at_top(1u32);
                deque.push_at_top(2u32);
            }
            deque.open_to_thieves();

            let thief = {
                let deque = deque.clone();
                thread::spawn(move || deque.steal().success())
            };

            let mut taken = Vec::new();
            unsafe {
                while let Some(item) = deque.pop() {
                    taken.push(item);
                }
            }

            if let Some(item) = thief.join().unwrap() {
                taken.push(item);
            }

            taken.sort();
            assert_eq!(taken, vec![1, 2]);
        });
    }
}
