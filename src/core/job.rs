use std::ops::Range;

// Job data is shared through trait objects, which loom's `Arc` can't hold. Loom models
// only look at the queues, so the job references use the standard one.
use std::sync::Arc;

/// The slice of a workload carried by a `JobRef`.
///
/// A chunk is a contiguous range of item indices belonging to one dispatch cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    /// Index of the chunk within its cycle. Used to find the chunk's completion
    /// signal and progress counter.
    pub index: usize,
    /// The dispatch cycle this chunk was created for.
    pub cycle: u64,
}

impl Chunk {
    #[inline]
    pub fn range(&self) -> Range<usize> { self.start..self.end }

    #[inline]
    pub fn len(&self) -> usize { self.end.saturating_sub(self.start) }

    #[inline]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Something that can process chunks of work on any thread of the pool.
///
/// `thread_index` identifies the executing thread: worker threads have indices in
/// `0..num_worker_threads`, any other thread (typically the one that dispatched the
/// work and helps while waiting) uses `num_worker_threads`.
pub trait Job: Send + Sync {
    fn execute(&self, chunk: Chunk, thread_index: usize);
}

impl<F> Job for F where F: Fn(Chunk, usize) + Send + Sync {
    fn execute(&self, chunk: Chunk, thread_index: usize) { self(chunk, thread_index) }
}

/// What gets pushed, popped and stolen from the queues.
///
/// A reference to the shared job data plus the chunk this particular entry is
/// responsible for. Several `JobRef`s usually point to the same job, one per chunk.
///
/// The job data is reference counted, so a job that outlives the code that dispatched
/// it (for example after a timed out wait) stays valid until it is done.
#[derive(Clone)]
pub struct JobRef {
    job: Arc<dyn Job>,
    chunk: Chunk,
}

impl JobRef {
    pub fn new(job: Arc<dyn Job>, chunk: Chunk) -> Self {
        JobRef { job, chunk }
    }

    #[inline]
    pub fn chunk(&self) -> Chunk { self.chunk }

    #[inline]
    pub fn execute(&self, thread_index: usize) {
        self.job.execute(self.chunk, thread_index);
    }
}

impl std::fmt::Debug for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRef").field("chunk", &self.chunk).finish()
    }
}

#[test]
fn job_ref_executes_its_chunk() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let sum = Arc::new(AtomicUsize::new(0));
    let sum2 = sum.clone();
    let job: Arc<dyn Job> = Arc::new(move |chunk: Chunk, thread_index: usize| {
        assert_eq!(thread_index, 3);
        for i in chunk.range() {
            sum2.fetch_add(i, Ordering::Relaxed);
        }
    });

    let chunk = Chunk { start: 10, end: 14, index: 0, cycle: 1 };
    let job_ref = JobRef::new(job, chunk);
    assert_eq!(job_ref.chunk().len(), 4);

    job_ref.clone().execute(3);
    assert_eq!(sum.load(Ordering::Relaxed), 10 + 11 + 12 + 13);
}
