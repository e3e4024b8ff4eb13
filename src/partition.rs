//! Splitting `[0, item_count)` into per-thread chunks.

use std::ops::Range;

/// A contiguous range of items assigned to a thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionRange {
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    pub thread_index: usize,
    /// Position of the range in `Partition::chunks`. The synchronous tail uses
    /// `chunks.len()`.
    pub chunk_index: usize,
}

impl PartitionRange {
    #[inline]
    pub fn range(&self) -> Range<usize> { self.start..self.end }

    #[inline]
    pub fn len(&self) -> usize { self.end - self.start }

    #[inline]
    pub fn is_empty(&self) -> bool { self.start == self.end }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// `chunks_per_thread` consecutive chunks per dispatched thread, in thread order.
    /// Some of them may be empty.
    pub chunks: Vec<PartitionRange>,
    /// The share of the dispatching thread, if it takes part.
    pub tail: Option<PartitionRange>,
    pub range_per_thread: usize,
    pub range_per_chunk: usize,
}

impl Partition {
    pub fn non_empty_chunks(&self) -> impl Iterator<Item = &PartitionRange> {
        self.chunks.iter().filter(|chunk| !chunk.is_empty())
    }

    /// Number of threads (from index zero) that have at least one non-empty chunk.
    ///
    /// Earlier threads are always served first, so this is also the number of workers
    /// worth waking up.
    pub fn threads_with_work(&self) -> usize {
        self.non_empty_chunks()
            .map(|chunk| chunk.thread_index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn tail_len(&self) -> usize {
        self.tail.map_or(0, |tail| tail.len())
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Split `[0, item_count)` between `available_threads` threads.
///
/// Each thread gets `ceil(item_count / available_threads)` items (the last ones may get
/// less, or nothing), sliced into `chunks_per_thread` chunks of
/// `max(1, ceil(range_per_thread / chunks_per_thread))` items.
///
/// If `caller_share` is true the last thread is the one that dispatches the work: its
/// share is returned as the `tail`, to be processed synchronously, instead of as
/// chunks.
///
/// The result only depends on the parameters.
pub fn partition(
    item_count: usize,
    available_threads: usize,
    chunks_per_thread: usize,
    caller_share: bool,
) -> Partition {
    let available_threads = available_threads.max(1);
    let chunks_per_thread = chunks_per_thread.max(1);

    let range_per_thread = div_ceil(item_count, available_threads);
    let range_per_chunk = div_ceil(range_per_thread, chunks_per_thread).max(1);

    let thread_range = |thread_index: usize| {
        let start = (thread_index * range_per_thread).min(item_count);
        let end = (start + range_per_thread).min(item_count);
        start..end
    };

    let dispatched_threads = if caller_share { available_threads - 1 } else { available_threads };

    let mut chunks = Vec::with_capacity(dispatched_threads * chunks_per_thread);
    for thread_index in 0..dispatched_threads {
        let range = thread_range(thread_index);
        for chunk in 0..chunks_per_thread {
            let start = (range.start + chunk * range_per_chunk).min(range.end);
            let end = (start + range_per_chunk).min(range.end);
            let chunk_index = chunks.len();
            chunks.push(PartitionRange { start, end, thread_index, chunk_index });
        }
    }

    let tail = if caller_share {
        let thread_index = available_threads - 1;
        let range = thread_range(thread_index);
        Some(PartitionRange {
            start: range.start,
            // The tail always extends to the end, whatever the rounding did.
            end: item_count,
            thread_index,
            chunk_index: chunks.len(),
        })
    } else {
        None
    };

    Partition {
        chunks,
        tail,
        range_per_thread,
        range_per_chunk,
    }
}

#[test]
fn partition_covers_everything_once() {
    for item_count in 0..=10_000 {
        for threads in 1..=32 {
            for chunks_per_thread in 1..=8 {
                for caller_share in [false, true] {
                    let partition = partition(item_count, threads, chunks_per_thread, caller_share);

                    // Ranges come in item order, each starting where the previous one ends,
                    // so they cover everything exactly once iff the last one ends at
                    // `item_count`.
                    let mut end = 0;
                    for range in partition.chunks.iter().chain(partition.tail.iter()) {
                        assert!(
                            range.start == end && range.start <= range.end,
                            "bad range {range:?}: items {item_count}, threads {threads}, chunks {chunks_per_thread}, caller {caller_share}",
                        );
                        end = range.end;
                    }
                    assert_eq!(end, item_count);

                    let dispatched = if caller_share { threads - 1 } else { threads };
                    assert_eq!(partition.chunks.len(), dispatched * chunks_per_thread);
                }
            }
        }
    }
}

#[test]
fn partition_is_contiguous_and_ordered() {
    let partition = partition(997, 5, 2, true);
    assert_eq!(partition.range_per_thread, 200);
    assert_eq!(partition.range_per_chunk, 100);

    let mut expected_start = 0;
    for (i, chunk) in partition.chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert_eq!(chunk.thread_index, i / 2);
        assert_eq!(chunk.start, expected_start);
        expected_start = chunk.end;
    }

    assert_eq!(partition.tail, Some(PartitionRange { start: 800, end: 997, thread_index: 4, chunk_index: 8 }));
    assert_eq!(partition.threads_with_work(), 4);
    assert_eq!(partition.tail_len(), 197);
}

#[test]
fn earlier_threads_get_the_remainder() {
    let partition = partition(10, 4, 1, false);
    let lens: Vec<usize> = partition.chunks.iter().map(|c| c.len()).collect();
    assert_eq!(lens, vec![3, 3, 3, 1]);
}

#[test]
fn few_items_leave_empty_chunks() {
    let partition = partition(3, 4, 2, false);
    assert_eq!(partition.chunks.len(), 8);
    assert_eq!(partition.non_empty_chunks().count(), 3);
    assert_eq!(partition.threads_with_work(), 3);
    assert!(partition.chunks[7].is_empty());

    let nothing = crate::partition::partition(0, 4, 2, true);
    assert_eq!(nothing.threads_with_work(), 0);
    assert_eq!(nothing.tail_len(), 0);
}

#[test]
fn single_thread_with_caller_share_is_synchronous() {
    let partition = partition(50, 1, 4, true);
    assert!(partition.chunks.is_empty());
    assert_eq!(partition.tail.map(|t| t.range()), Some(0..50));
}
