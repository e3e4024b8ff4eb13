use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

/// Fixed-size circular storage backing a `WorkStealingDeque`.
///
/// Logical indices are absolute (they keep increasing or decreasing as items are
/// pushed and taken) and are mapped onto the storage with a bit mask, so the capacity
/// is always a power of two. Negative indices are fine, they wrap like any other.
///
/// The buffer doesn't track which slots hold a live value. It never drops the items
/// it stores: ownership of a slot's content is decided by the deque's `top`/`bottom`
/// cursors, and the deque is responsible for dropping what is left when it goes away.
///
/// No synchronization happens here. Growing produces a new buffer and the caller is
/// expected to swap it in while nobody else is looking.
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    // Incremented each time the buffer is replaced by a larger one.
    version: u32,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    pub const MIN_CAPACITY: usize = 2;

    /// Creates a buffer holding at least `capacity` slots, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        RingBuffer::with_version(capacity, 0)
    }

    fn with_version(capacity: usize, version: u32) -> Self {
        let capacity = capacity.max(Self::MIN_CAPACITY).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        RingBuffer {
            slots,
            mask: capacity - 1,
            version,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        self.slots[(index as usize) & self.mask].get()
    }

    /// Bitwise copy of the value at `index`.
    ///
    /// The result is left wrapped in `MaybeUninit` on purpose: a thief reads a slot
    /// before knowing whether it won the race for it, and must be able to forget the
    /// copy without running its destructor.
    ///
    /// Unsafe: the slot must have been written with `put` and the caller must not
    /// assume ownership of the copy unless it holds the slot according to the deque
    /// cursors.
    #[inline]
    pub unsafe fn get(&self, index: isize) -> MaybeUninit<T> {
        ptr::read(self.slot(index))
    }

    /// Writes `value` at `index` without dropping the previous content of the slot.
    ///
    /// Unsafe: no other thread may be reading or writing the same slot.
    #[inline]
    pub unsafe fn put(&self, index: isize, value: T) {
        ptr::write(self.slot(index), MaybeUninit::new(value));
    }

    /// Returns a buffer of `new_capacity` slots (rounded up to a power of two) holding
    /// the logical window `[top, bottom)` at the same logical indices.
    ///
    /// The values are moved bitwise: once the new buffer is in use, `self` must be
    /// dropped without touching its slots again (dropping a `RingBuffer` never drops
    /// the items).
    ///
    /// Unsafe: every slot of the window must be initialized and nobody may access
    /// `self` concurrently.
    pub unsafe fn grow(&self, top: isize, bottom: isize, new_capacity: usize) -> RingBuffer<T> {
        debug_assert!(top <= bottom);
        debug_assert!(new_capacity > (bottom - top) as usize);

        let grown = RingBuffer::with_version(new_capacity, self.version.wrapping_add(1));
        for index in top..bottom {
            ptr::copy_nonoverlapping(self.slot(index), grown.slot(index), 1);
        }

        grown
    }
}

#[test]
fn ring_buffer_rounds_capacity() {
    assert_eq!(RingBuffer::<u32>::new(0).capacity(), 2);
    assert_eq!(RingBuffer::<u32>::new(5).capacity(), 8);
    assert_eq!(RingBuffer::<u32>::new(64).capacity(), 64);
}

#[test]
fn ring_buffer_wraps_negative_indices() {
    let buffer = RingBuffer::new(4);
    unsafe {
        buffer.put(-1, 10u32);
        buffer.put(3, 30u32);
        // -1 and 3 are the same physical slot.
        assert_eq!(buffer.get(-1).assume_init(), 30);

        buffer.put(-6, 60u32);
        assert_eq!(buffer.get(2).assume_init(), 60);
        assert_eq!(buffer.get(6).assume_init(), 60);
    }
}

#[test]
fn ring_buffer_grow_keeps_logical_indices() {
    let buffer = RingBuffer::new(4);
    unsafe {
        for i in -2..2isize {
            buffer.put(i, i as i32 * 100);
        }

        let grown = buffer.grow(-2, 2, 8);
        assert_eq!(grown.capacity(), 8);
        assert_eq!(grown.version(), buffer.version() + 1);

        for i in -2..2isize {
            assert_eq!(grown.get(i).assume_init(), i as i32 * 100);
        }

        // The grown buffer has distinct physical slots for indices that used to alias.
        grown.put(2, 200);
        assert_eq!(grown.get(-2).assume_init(), -200);
        assert_eq!(grown.get(2).assume_init(), 200);
    }
}
