//! Failures raised by work items on arbitrary threads.
//!
//! Each thread has a slot holding the failures it ran into since the last drain, up to
//! `SLOT_CAPACITY` of them, and a shared counter keeps track of the total. The
//! scheduler drains the slots after each wait and logs what it finds. A slot never
//! grows: when it is full, its oldest failure is logged on the spot to make room.

use std::any::Any;
use std::fmt;

use crossbeam_utils::CachePadded;

use crate::core::sync::{AtomicU32, Mutex, Ordering};

/// A failure of a single work item.
#[derive(Debug)]
pub struct CycleFault {
    /// The thread that was executing the item. Worker threads have indices in
    /// `0..num_worker_threads`, the dispatching thread uses `num_worker_threads`.
    pub thread_index: usize,
    pub item_index: usize,
    pub cycle: u64,
    pub error: anyhow::Error,
}

impl fmt::Display for CycleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "item #{} failed on thread #{} (cycle {}): {:#}",
            self.item_index, self.thread_index, self.cycle, self.error,
        )
    }
}

/// Turns the payload of a caught panic into an error.
pub fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    };

    anyhow::anyhow!("panicked: {message}")
}

/// Failures a slot keeps between two drains. Past that, the oldest kept failure is
/// logged right away to make room.
pub const SLOT_CAPACITY: usize = 8;

struct ExceptionSlot {
    faults: Mutex<Vec<CycleFault>>,
}

/// What `FaultSlots::drain` found.
#[derive(Debug, Default)]
pub struct DrainedFaults {
    /// Total number of failures since the previous drain.
    pub count: u32,
    /// The failures that were still held by the slots, per thread in recording order.
    pub faults: Vec<CycleFault>,
}

pub struct FaultSlots {
    slots: Vec<CachePadded<ExceptionSlot>>,
    // Incremented before a failure is stored, decremented by what a drain takes out of
    // the slots. Never lower than the number of stored failures.
    pending: AtomicU32,
    displaced: AtomicU32,
}

impl FaultSlots {
    pub fn new(num_slots: usize) -> Self {
        FaultSlots {
            slots: (0..num_slots)
                .map(|_| CachePadded::new(ExceptionSlot {
                    faults: Mutex::new(Vec::with_capacity(SLOT_CAPACITY)),
                }))
                .collect(),
            pending: AtomicU32::new(0),
            displaced: AtomicU32::new(0),
        }
    }

    /// Number of failures recorded since the last drain.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Store a failure in the slot of the thread that raised it.
    pub fn record(&self, fault: CycleFault) {
        self.pending.fetch_add(1, Ordering::AcqRel);

        let slot = &self.slots[fault.thread_index.min(self.slots.len() - 1)];
        let mut faults = slot.faults.lock().unwrap();
        if faults.len() == SLOT_CAPACITY {
            let oldest = faults.remove(0);
            log::error!("{oldest}");
            self.displaced.fetch_add(1, Ordering::Relaxed);
        }
        faults.push(fault);
    }

    /// Log and clear every slot.
    ///
    /// A failure recorded while the drain is running is either part of this drain or
    /// still pending for the next one.
    pub fn drain(&self) -> DrainedFaults {
        if self.pending() == 0 {
            return DrainedFaults::default();
        }

        let mut drained = DrainedFaults::default();
        for slot in &self.slots {
            let mut faults = slot.faults.lock().unwrap();
            for fault in faults.drain(..) {
                log::error!("{fault}");
                drained.faults.push(fault);
            }
        }

        // Failures that were logged early when their slot was full.
        let displaced = self.displaced.swap(0, Ordering::Relaxed);
        drained.count = drained.faults.len() as u32 + displaced;
        self.pending.fetch_sub(drained.count, Ordering::AcqRel);

        drained
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fault(thread_index: usize, item_index: usize) -> CycleFault {
        CycleFault {
            thread_index,
            item_index,
            cycle: 1,
            error: anyhow::anyhow!("item {item_index} is broken"),
        }
    }

    #[test]
    fn drain_reports_and_clears() {
        let slots = FaultSlots::new(3);
        assert_eq!(slots.drain().count, 0);

        slots.record(fault(0, 3));
        slots.record(fault(2, 996));
        assert_eq!(slots.pending(), 2);

        let drained = slots.drain();
        assert_eq!(drained.count, 2);
        let mut items: Vec<usize> = drained.faults.iter().map(|f| f.item_index).collect();
        items.sort();
        assert_eq!(items, vec![3, 996]);

        assert_eq!(slots.pending(), 0);
        assert!(slots.drain().faults.is_empty());
    }

    #[test]
    fn one_thread_keeps_all_its_failures() {
        let slots = FaultSlots::new(2);
        slots.record(fault(1, 10));
        slots.record(fault(1, 11));
        slots.record(fault(1, 12));

        let drained = slots.drain();
        assert_eq!(drained.count, 3);
        let items: Vec<usize> = drained.faults.iter().map(|f| f.item_index).collect();
        assert_eq!(items, vec![10, 11, 12]);
    }

    #[test]
    fn full_slot_logs_the_oldest_failure() {
        let slots = FaultSlots::new(1);
        for item in 0..SLOT_CAPACITY + 3 {
            slots.record(fault(0, item));
        }
        assert_eq!(slots.pending(), SLOT_CAPACITY as u32 + 3);

        let drained = slots.drain();
        assert_eq!(drained.count, SLOT_CAPACITY as u32 + 3);
        assert_eq!(drained.faults.len(), SLOT_CAPACITY);
        assert_eq!(drained.faults[0].item_index, 3);
        assert_eq!(slots.pending(), 0);
    }

    #[test]
    fn late_failure_is_reported_by_the_next_drain() {
        let slots = FaultSlots::new(2);
        slots.record(fault(0, 1));
        assert_eq!(slots.drain().count, 1);

        // A straggler of the previous cycle fails after the drain.
        slots.record(fault(0, 2));
        assert_eq!(slots.pending(), 1);

        let drained = slots.drain();
        assert_eq!(drained.count, 1);
        assert_eq!(drained.faults[0].item_index, 2);
        assert_eq!(slots.pending(), 0);
    }

    #[test]
    fn drain_while_recording_loses_nothing() {
        use std::sync::Arc;

        for _ in 0..50 {
            let slots = Arc::new(FaultSlots::new(4));
            let threads: Vec<_> = (0..4).map(|thread_index| {
                let slots = slots.clone();
                std::thread::spawn(move || {
                    for item in 0..200 {
                        slots.record(fault(thread_index, thread_index * 1000 + item));
                        if item % 16 == 0 {
                            std::thread::yield_now();
                        }
                    }
                })
            }).collect();

            let mut count = 0;
            let mut kept = 0;
            while threads.iter().any(|t| !t.is_finished()) {
                let drained = slots.drain();
                count += drained.count;
                kept += drained.faults.len();
            }
            for thread in threads {
                thread.join().unwrap();
            }

            let drained = slots.drain();
            count += drained.count;
            kept += drained.faults.len();

            assert_eq!(count, 800);
            assert!(kept <= 800);
            assert_eq!(slots.pending(), 0);
        }
    }

    #[test]
    fn panic_payloads() {
        let err = panic_error(Box::new("static message"));
        assert_eq!(err.to_string(), "panicked: static message");

        let err = panic_error(Box::new(format!("item {}", 5)));
        assert_eq!(err.to_string(), "panicked: item 5");

        let err = panic_error(Box::new(42u32));
        assert_eq!(err.to_string(), "panicked: unknown panic payload");
    }

    #[test]
    fn display_includes_context() {
        let text = fault(2, 500).to_string();
        assert!(text.contains("#500"));
        assert!(text.contains("thread #2"));
        assert!(text.contains("item 500 is broken"));
    }
}
