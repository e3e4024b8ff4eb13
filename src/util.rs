use crate::core::sync::{AtomicBool, Ordering};

/// A simple utility to dynamically assert that a section of code or data is
/// accessed by a single thread at a time.
///
/// The deques use it in debug builds to catch two threads acting as the owner
/// at the same time. Only use this for debugging.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }
}

#[cfg(not(loom))]
#[test]
fn exclu_check_01() {
    let lock = ExclusiveCheck::with_tag("deque owner");

    lock.begin();
    lock.end();

    lock.begin();
    lock.end();
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn exclu_check_02() {
    let lock = ExclusiveCheck::with_tag(());

    lock.begin();
    lock.begin();

    lock.end();
    lock.end();
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn exclu_check_end_without_begin() {
    let lock = ExclusiveCheck::with_tag(0u32);

    lock.end();
}
