//! End-to-end scenarios for the thread pool: lifecycle stress, task
//! accounting, result delivery and load balancing across worker counts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stealpool::{Builder, ThreadPool};

const WORKER_COUNTS: &[usize] = &[1, 2, 3, 4, 12];
const JOBS: usize = 1 << 21;

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn construct_destruct_stress() {
    for _ in 0..10_000 {
        let _pool = ThreadPool::default();
    }
}

#[test]
fn empty_pool_drops_promptly() {
    let start = Instant::now();
    drop(ThreadPool::new(4));
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "dropping an idle pool should not hang"
    );
}

// ============================================================================
// Task accounting
// ============================================================================

fn null_jobs(workers: usize) {
    let mut handles = Vec::with_capacity(JOBS);
    {
        let pool = ThreadPool::new(workers);
        for _ in 0..JOBS {
            handles.push(pool.enqueue(|| {}));
        }
    }
    for handle in handles {
        handle.join().expect("null job must resolve with a value");
    }
}

#[test]
fn null_jobs_1_worker() {
    null_jobs(1);
}

#[test]
fn null_jobs_2_workers() {
    null_jobs(2);
}

#[test]
fn null_jobs_3_workers() {
    null_jobs(3);
}

#[test]
fn null_jobs_4_workers() {
    null_jobs(4);
}

#[test]
fn null_jobs_12_workers() {
    null_jobs(12);
}

fn detached_counter(workers: usize) {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let pool = ThreadPool::new(workers);
        for _ in 0..JOBS {
            let counter = Arc::clone(&counter);
            pool.enqueue_detach(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    assert_eq!(counter.load(Ordering::Relaxed), JOBS);
}

#[test]
fn detached_counter_1_worker() {
    detached_counter(1);
}

#[test]
fn detached_counter_2_workers() {
    detached_counter(2);
}

#[test]
fn detached_counter_3_workers() {
    detached_counter(3);
}

#[test]
fn detached_counter_4_workers() {
    detached_counter(4);
}

#[test]
fn detached_counter_12_workers() {
    detached_counter(12);
}

// ============================================================================
// Result delivery
// ============================================================================

fn identity_echo(workers: usize) {
    let mut handles = Vec::with_capacity(JOBS);
    {
        let pool = ThreadPool::new(workers);
        for i in 0..JOBS {
            handles.push(pool.enqueue(move || i));
        }
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), i);
    }
}

#[test]
fn identity_echo_1_worker() {
    identity_echo(1);
}

#[test]
fn identity_echo_2_workers() {
    identity_echo(2);
}

#[test]
fn identity_echo_3_workers() {
    identity_echo(3);
}

#[test]
fn identity_echo_4_workers() {
    identity_echo(4);
}

#[test]
fn identity_echo_12_workers() {
    identity_echo(12);
}

// ============================================================================
// Blocking and heterogeneous workloads
// ============================================================================

fn waiting_jobs(workers: usize) {
    let mut handles = Vec::new();
    let start = Instant::now();
    {
        let pool = ThreadPool::new(workers);
        for i in 0..100 {
            handles.push(pool.enqueue(move || {
                thread::sleep(Duration::from_millis(100));
                i
            }));
        }
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), i);
    }
    if workers >= 2 {
        // 100 sequential sleeps would take ten seconds.
        assert!(
            start.elapsed() < Duration::from_secs(9),
            "sleeps must overlap across {workers} workers"
        );
    }
}

#[test]
fn waiting_jobs_1_worker() {
    waiting_jobs(1);
}

#[test]
fn waiting_jobs_2_workers() {
    waiting_jobs(2);
}

#[test]
fn waiting_jobs_3_workers() {
    waiting_jobs(3);
}

#[test]
fn waiting_jobs_4_workers() {
    waiting_jobs(4);
}

#[test]
fn waiting_jobs_12_workers() {
    waiting_jobs(12);
}

fn heterogeneous_sleeps(workers: usize) {
    let mut handles = Vec::new();
    {
        let pool = ThreadPool::new(workers);
        for i in 0..10 * workers as u64 {
            handles.push(pool.enqueue(move || {
                thread::sleep(Duration::from_millis(i * 10));
            }));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn heterogeneous_sleeps_1_worker() {
    heterogeneous_sleeps(1);
}

#[test]
fn heterogeneous_sleeps_2_workers() {
    heterogeneous_sleeps(2);
}

#[test]
fn heterogeneous_sleeps_3_workers() {
    heterogeneous_sleeps(3);
}

#[test]
fn heterogeneous_sleeps_4_workers() {
    heterogeneous_sleeps(4);
}

#[test]
fn heterogeneous_sleeps_12_workers() {
    heterogeneous_sleeps(12);
}

// ============================================================================
// CPU-bound workloads
// ============================================================================

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

fn heavy_cpu(workers: usize) {
    let mut handles = Vec::new();
    {
        let pool = ThreadPool::new(workers);
        for _ in 0..100 {
            handles.push(pool.enqueue(|| is_prime(50_000_719)));
        }
    }
    for handle in handles {
        assert!(handle.join().unwrap(), "50_000_719 is prime");
    }
}

#[test]
fn heavy_cpu_1_worker() {
    heavy_cpu(1);
}

#[test]
fn heavy_cpu_2_workers() {
    heavy_cpu(2);
}

#[test]
fn heavy_cpu_3_workers() {
    heavy_cpu(3);
}

#[test]
fn heavy_cpu_4_workers() {
    heavy_cpu(4);
}

#[test]
fn heavy_cpu_12_workers() {
    heavy_cpu(12);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[test]
fn single_worker_runs_jobs_in_submission_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let pool = ThreadPool::new(1);
        for i in 0..1000 {
            let order = Arc::clone(&order);
            pool.enqueue_detach(move || {
                order.lock().unwrap().push(i);
            });
        }
    }
    let order = order.lock().unwrap();
    let expected: Vec<usize> = (0..1000).collect();
    assert_eq!(*order, expected, "one worker that only steals runs FIFO");
}

#[test]
fn queue_grows_past_initial_capacity_without_losing_jobs() {
    const BURST: usize = 4096;

    let counter = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(AtomicBool::new(false));
    {
        let pool = Builder::new().workers(1).build();

        // Stall the only worker so the burst piles up in its deque.
        {
            let gate = Arc::clone(&gate);
            let counter = Arc::clone(&counter);
            pool.enqueue_detach(move || {
                while !gate.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        thread::sleep(Duration::from_millis(50));

        for _ in 0..BURST {
            let counter = Arc::clone(&counter);
            pool.enqueue_detach(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        gate.store(true, Ordering::Release);
    }
    assert_eq!(counter.load(Ordering::Relaxed), BURST + 1);
}

#[test]
fn stealing_spreads_load_across_workers() {
    // Pin one worker on a long job and verify the rest of the submissions
    // still complete well before a serial schedule could.
    let start = Instant::now();
    let mut handles = Vec::new();
    {
        let pool = ThreadPool::new(4);
        handles.push(pool.enqueue(|| thread::sleep(Duration::from_millis(300))));
        for _ in 0..40 {
            handles.push(pool.enqueue(|| thread::sleep(Duration::from_millis(10))));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "41 sleeping jobs across 4 workers must overlap"
    );
}
