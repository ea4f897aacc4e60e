//! The pool dispatcher: worker threads, per-worker deques, submission and
//! shutdown.
//!
//! Every worker owns one lane, a pairing of a [`Semaphore`] and a
//! work-stealing deque. Submissions are spread round-robin over the lanes
//! and wake the matching worker; a woken worker drains its own lane first
//! and steals from a randomly chosen peer once the home lane looks empty.
//!
//! Producer discipline: the deque is single-producer, but `enqueue` may be
//! called from any number of threads, so each lane's owner end sits behind a
//! mutex and is touched only by submitters. Workers never pop; they steal,
//! including from their own lane, which also makes a single-worker pool run
//! jobs in submission order.
//!
//! Quiescence: `in_flight` is incremented before the semaphore release that
//! announces a job and decremented by the worker between a successful steal
//! and the invocation. A worker leaves its inner loop only when `in_flight`
//! reaches zero, and exits only once the stop flag is also set, so dropping
//! the pool runs every job that was ever submitted.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::deque;
use crate::rng::Xoroshiro128StarStar;
use crate::semaphore::Semaphore;
use crate::task::{Job, JobHandle};

/// Consecutive failed looks at the home lane before a worker starts
/// picking random victims. Keeps tiny task bursts on their home worker.
const SPIN_BIAS: usize = 64;

/// One worker's share of the pool.
struct Lane {
    sem: Semaphore,
    /// Producer end. Locked by submitters only.
    injector: Mutex<deque::Worker<Job>>,
    /// Consumer end, shared by every worker.
    stealer: deque::Stealer<Job>,
}

struct Shared {
    lanes: Box<[Lane]>,
    /// Submitted but not yet started jobs. See the module docs for the
    /// ordering pairing with the worker loop.
    in_flight: CachePadded<AtomicI64>,
    /// Round-robin cursor over the lanes.
    submit_cursor: CachePadded<AtomicU64>,
    stop: AtomicBool,
}

/// Configures and builds a [`ThreadPool`].
#[derive(Debug)]
pub struct Builder {
    workers: Option<usize>,
    queue_capacity: usize,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            workers: None,
            queue_capacity: deque::DEFAULT_CAPACITY,
        }
    }

    /// Number of worker threads. Defaults to the available parallelism.
    pub fn workers(mut self, workers: usize) -> Builder {
        self.workers = Some(workers);
        self
    }

    /// Initial capacity of each worker's deque. Deques grow on demand;
    /// this only sizes the first allocation.
    pub fn queue_capacity(mut self, capacity: usize) -> Builder {
        self.queue_capacity = capacity;
        self
    }

    /// Starts the workers and returns the pool.
    ///
    /// # Panics
    ///
    /// Panics if the worker count is zero, if the queue capacity is not a
    /// power of two, or if a worker thread cannot be spawned.
    pub fn build(self) -> ThreadPool {
        let workers = self.workers.unwrap_or_else(default_workers);
        assert!(workers >= 1, "thread pool needs at least one worker");

        let lanes: Box<[Lane]> = (0..workers)
            .map(|_| {
                let owner = deque::Worker::with_capacity(self.queue_capacity);
                Lane {
                    sem: Semaphore::new(0),
                    stealer: owner.stealer(),
                    injector: Mutex::new(owner),
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            lanes,
            in_flight: CachePadded::new(AtomicI64::new(0)),
            submit_cursor: CachePadded::new(AtomicU64::new(0)),
            stop: AtomicBool::new(false),
        });

        let threads = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("stealpool-worker-{id}"))
                    .spawn(move || worker_loop(&shared, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(workers, "thread pool started");
        ThreadPool { shared, threads }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Work-stealing thread pool.
///
/// Dropping the pool blocks until every submitted job has run, then joins
/// the workers. Jobs still queued if the pool is torn down abnormally
/// resolve their handles as abandoned.
///
/// # Examples
///
/// ```
/// let pool = stealpool::ThreadPool::new(4);
/// let handle = pool.enqueue(|| 2 + 2);
/// assert_eq!(handle.join().unwrap(), 4);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with `workers` threads and default queue capacity.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> ThreadPool {
        Builder::new().workers(workers).build()
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.shared.lanes.len()
    }

    /// Submits `f` and returns a handle to its result.
    ///
    /// The closure and its captures are taken by value; callers that want
    /// to share state capture an `Arc` or a reference with `'static`
    /// lifetime explicitly. A panic inside `f` is captured and surfaces as
    /// [`JoinError::Panicked`](crate::JoinError::Panicked) on the handle.
    pub fn enqueue<F, R>(&self, f: F) -> JobHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (job, handle) = Job::with_handle(f);
        self.submit(job);
        handle
    }

    /// Submits `f` without producing a handle. A panic inside `f` is
    /// caught and logged.
    pub fn enqueue_detach<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Job::detached(f));
    }

    fn submit(&self, job: Job) {
        let shared = &*self.shared;
        let slot = shared.submit_cursor.fetch_add(1, Ordering::Relaxed);
        let lane = &shared.lanes[(slot % shared.lanes.len() as u64) as usize];

        // Counted before the wakeup so a worker that observes the permit
        // also observes a non-zero in-flight count.
        shared.in_flight.fetch_add(1, Ordering::Relaxed);
        lane.injector
            .lock()
            .expect("lane injector poisoned")
            .push(job);
        lane.sem.release(1);
    }
}

impl Default for ThreadPool {
    /// A pool sized to the available parallelism.
    fn default() -> ThreadPool {
        Builder::new().build()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        // One release per lane unblocks workers parked on an empty pool.
        for lane in self.shared.lanes.iter() {
            lane.sem.release(1);
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        tracing::debug!("thread pool stopped");
    }
}

fn worker_loop(shared: &Shared, id: usize) {
    tracing::trace!(worker = id, "worker started");

    let lanes = shared.lanes.len() as u64;
    let home = &shared.lanes[id];
    // Workers occupy disjoint subsequences of a common generator.
    let mut rng = Xoroshiro128StarStar::new();
    rng.jump(id as u64);

    loop {
        // Parks while the pool is quiescent; a burst of submissions is
        // drained with this single wakeup.
        home.sem.acquire_many();

        let mut spins: usize = 0;
        loop {
            let victim = if spins < SPIN_BIAS || !home.stealer.is_empty() {
                id
            } else {
                (rng.next_u64() % lanes) as usize
            };

            if let Some(job) = shared.lanes[victim].stealer.steal() {
                spins = 0;
                // Decremented before the invocation; the pairing Acquire
                // below keeps shutdown behind every job body.
                shared.in_flight.fetch_sub(1, Ordering::Release);
                job.run();
            } else {
                spins += 1;
            }

            if shared.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
        }

        if shared.stop.load(Ordering::Relaxed)
            && shared.in_flight.load(Ordering::Acquire) == 0
        {
            break;
        }
    }

    tracing::trace!(worker = id, "worker stopped");
}
