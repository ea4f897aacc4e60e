//! Lock-free single-producer multi-consumer work-stealing deque.
//!
//! This is the deque described in "Correct and Efficient Work-Stealing for
//! Weak Memory Models" (Le, Pop, Cohen, Nardelli, PPoPP'13), split into an
//! owner handle and a thief handle:
//!
//! - [`Worker`]: `push` and `pop` at the bottom. `Send` but `!Sync`, so the
//!   single-producer discipline is enforced at compile time.
//! - [`Stealer`]: `steal` at the top from any thread. `Clone + Send + Sync`.
//!
//! Storage is a power-of-two ring of atomic element pointers. The ring itself
//! is inert: every cell access is relaxed, and all inter-thread ordering
//! comes from the fences in `push`/`pop`/`steal`. When the ring fills, the
//! owner publishes a doubled copy and retires the old one into a garbage
//! list, because a thief that loaded the old buffer pointer may still be
//! reading from it. Retired buffers are freed only when the last handle is
//! dropped.
//!
//! The fence placement is load-bearing. Do not "upgrade" everything to
//! `SeqCst` or relax the standalone fences:
//!
//! - `push`'s `Release` fence pairs with `steal`'s `Acquire` load of `top`
//!   and the `SeqCst` fence, publishing the freshly written cell before a
//!   thief can observe the incremented `bottom`.
//! - `pop`'s `SeqCst` fence keeps the `bottom` decrement from reordering
//!   past the `top` read, so a race over the last element resolves uniquely.
//! - `steal`'s `SeqCst` fence between the `top` and `bottom` loads keeps a
//!   stale `top` from pairing with a stale `bottom` and conjuring a
//!   non-empty queue out of an empty one.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Default capacity of a freshly constructed deque.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Retired-buffer list reservation. 32 doublings from the default capacity
/// is a queue of over four trillion elements, so the list never reallocates
/// on the push path in practice.
const GARBAGE_RESERVE: usize = 32;

/// Power-of-two ring of atomic element pointers with modulo indexing.
///
/// Cell loads and stores are relaxed; the deque protocol supplies ordering.
/// The ring never owns the elements behind the pointers it holds.
struct RingBuffer<T> {
    cap: i64,
    mask: i64,
    cells: Box<[AtomicPtr<T>]>,
}

impl<T> RingBuffer<T> {
    fn new(cap: i64) -> RingBuffer<T> {
        debug_assert!(cap > 0 && cap & (cap - 1) == 0);
        let cells = (0..cap).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        RingBuffer {
            cap,
            mask: cap - 1,
            cells,
        }
    }

    #[inline]
    fn capacity(&self) -> i64 {
        self.cap
    }

    #[inline]
    fn store(&self, i: i64, x: *mut T) {
        self.cells[(i & self.mask) as usize].store(x, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self, i: i64) -> *mut T {
        self.cells[(i & self.mask) as usize].load(Ordering::Relaxed)
    }

    /// Allocates a ring of twice the capacity holding the cells in the
    /// logical range `[top, bottom)`. The old ring is left untouched.
    fn resize(&self, bottom: i64, top: i64) -> RingBuffer<T> {
        let grown = RingBuffer::new(2 * self.cap);
        let mut i = top;
        while i != bottom {
            grown.store(i, self.load(i));
            i += 1;
        }
        grown
    }
}

/// State shared by a [`Worker`] and its [`Stealer`]s.
struct Inner<T> {
    /// Logical index the next thief will take. Monotonically non-decreasing.
    top: CachePadded<AtomicI64>,
    /// Logical index the owner will write next. Non-decreasing except for
    /// the transient decrement inside `pop`.
    bottom: CachePadded<AtomicI64>,
    /// Current ring. Replaced (never freed) by the owner on growth.
    buffer: AtomicPtr<RingBuffer<T>>,
    /// Retired rings. Owner-only; kept as raw pointers because thieves may
    /// still be reading through them, freed when the last handle drops.
    garbage: UnsafeCell<Vec<*mut RingBuffer<T>>>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Both handle types keep this alive through an `Arc`, so reaching
        // here means no other thread can touch the deque again.
        let buffer = unsafe { Box::from_raw(*self.buffer.get_mut()) };
        let top = *self.top.get_mut();
        let bottom = *self.bottom.get_mut();
        let mut i = top;
        while i < bottom {
            drop(unsafe { Box::from_raw(buffer.load(i)) });
            i += 1;
        }
        // Retired rings only hold stale copies of cell pointers, and
        // `RingBuffer` never frees elements, so releasing them cannot touch
        // an element twice.
        for retired in self.garbage.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(retired) });
        }
    }
}

/// Owner handle. Only this handle may `push` and `pop`.
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
    /// `Send + !Sync`: the owner end may migrate between threads but never
    /// be shared across them.
    _marker: PhantomData<Cell<()>>,
}

/// Thief handle. Any number of threads may `steal` through clones of this.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Worker<T> {
    /// Creates a deque with the default capacity and returns its owner end.
    pub fn new() -> Worker<T> {
        Worker::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a deque with the given initial capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Worker<T> {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "deque capacity must be a non-zero power of two"
        );
        let buffer = Box::into_raw(Box::new(RingBuffer::new(capacity as i64)));
        Worker {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicI64::new(0)),
                bottom: CachePadded::new(AtomicI64::new(0)),
                buffer: AtomicPtr::new(buffer),
                garbage: UnsafeCell::new(Vec::with_capacity(GARBAGE_RESERVE)),
            }),
            _marker: PhantomData,
        }
    }

    /// Returns a new thief handle for this deque.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Pushes an element at the bottom, growing the ring if it is full.
    pub fn push(&self, value: T) {
        let x = Box::into_raw(Box::new(value));
        let inner = &*self.inner;

        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);
        let mut a = inner.buffer.load(Ordering::Relaxed);

        unsafe {
            if (*a).capacity() - 1 < b - t {
                // Full. Publish a doubled ring and retire the old one; a
                // concurrent thief may still hold a pointer into it.
                let grown = Box::into_raw(Box::new((*a).resize(b, t)));
                inner.buffer.store(grown, Ordering::Relaxed);
                (*inner.garbage.get()).push(a);
                a = grown;
            }
            (*a).store(b, x);
        }

        // Publish the cell write before a thief can observe the new bottom.
        fence(Ordering::Release);
        inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Pops an element from the bottom.
    ///
    /// Returns `None` when the deque is empty, or when the deque held a
    /// single element and a thief won the race for it.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;

        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        let a = inner.buffer.load(Ordering::Relaxed);
        inner.bottom.store(b, Ordering::Relaxed);
        // The decrement must be visible before top is read, so a concurrent
        // steal of the same element cannot also succeed.
        fence(Ordering::SeqCst);
        let t = inner.top.load(Ordering::Relaxed);

        if t <= b {
            let x = unsafe { (*a).load(b) };
            if t == b {
                // Last element. Race a thief by advancing top past it;
                // bottom is restored on both outcomes.
                let won = inner
                    .top
                    .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                inner.bottom.store(b + 1, Ordering::Relaxed);
                if !won {
                    return None;
                }
            }
            let value = unsafe { Box::from_raw(x) };
            Some(*value)
        } else {
            inner.bottom.store(b + 1, Ordering::Relaxed);
            None
        }
    }

    /// Number of elements in the deque at the instant of the call.
    pub fn len(&self) -> usize {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    /// Snapshot emptiness test. Advisory only.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Worker<T> {
    fn default() -> Worker<T> {
        Worker::new()
    }
}

impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Worker { .. }")
    }
}

impl<T> Stealer<T> {
    /// Steals an element from the top.
    ///
    /// Returns `None` when the deque appears empty or when another thread
    /// won the race for the observed element. Callers that must make
    /// progress simply retry.
    pub fn steal(&self) -> Option<T> {
        let inner = &*self.inner;

        let t = inner.top.load(Ordering::Acquire);
        // Order the top load before the bottom load; stale pairs of the two
        // must not fabricate a non-empty deque.
        fence(Ordering::SeqCst);
        let b = inner.bottom.load(Ordering::Acquire);

        if t < b {
            // The paper reads the buffer with `consume`; `Acquire` is the
            // closest ordering Rust offers.
            let a = inner.buffer.load(Ordering::Acquire);
            let x = unsafe { (*a).load(t) };
            if inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            let value = unsafe { Box::from_raw(x) };
            Some(*value)
        } else {
            None
        }
    }

    /// Snapshot emptiness test. Advisory only.
    pub fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        inner.bottom.load(Ordering::Relaxed) <= inner.top.load(Ordering::Relaxed)
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Stealer { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn owner_pop_is_lifo() {
        let worker = Worker::new();
        worker.push(1);
        worker.push(2);
        worker.push(3);

        assert_eq!(worker.len(), 3);
        assert_eq!(worker.pop(), Some(3));
        assert_eq!(worker.pop(), Some(2));
        assert_eq!(worker.pop(), Some(1));
        assert_eq!(worker.pop(), None);
        assert!(worker.is_empty());
    }

    #[test]
    fn steal_is_fifo() {
        let worker = Worker::new();
        let stealer = worker.stealer();
        worker.push("a");
        worker.push("b");
        worker.push("c");

        assert_eq!(stealer.steal(), Some("a"));
        assert_eq!(stealer.steal(), Some("b"));
        assert_eq!(stealer.steal(), Some("c"));
        assert_eq!(stealer.steal(), None);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let worker = Worker::with_capacity(16);
        for i in 0..1000 {
            worker.push(i);
        }
        assert_eq!(worker.len(), 1000);
        for i in (0..1000).rev() {
            assert_eq!(worker.pop(), Some(i));
        }
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn growth_preserves_order_for_thieves() {
        let worker = Worker::with_capacity(8);
        let stealer = worker.stealer();
        for i in 0..64 {
            worker.push(i);
        }
        for i in 0..64 {
            assert_eq!(stealer.steal(), Some(i));
        }
    }

    struct CountsDrop<'a>(&'a AtomicUsize);

    impl Drop for CountsDrop<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_the_deque_drops_leftover_elements_once() {
        let drops = AtomicUsize::new(0);
        {
            let worker = Worker::with_capacity(8);
            let stealer = worker.stealer();
            for _ in 0..20 {
                worker.push(CountsDrop(&drops));
            }
            drop(worker.pop());
            drop(stealer.steal());
            assert_eq!(drops.load(Ordering::Relaxed), 2);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn every_pushed_item_is_taken_exactly_once() {
        const ITEMS: u64 = 100_000;
        const THIEVES: usize = 4;

        let worker = Worker::with_capacity(64);
        let remaining = AtomicUsize::new(ITEMS as usize);
        let sum = AtomicU64::new(0);

        thread::scope(|s| {
            for _ in 0..THIEVES {
                let stealer = worker.stealer();
                let remaining = &remaining;
                let sum = &sum;
                s.spawn(move || {
                    while remaining.load(Ordering::Acquire) != 0 {
                        if let Some(v) = stealer.steal() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            remaining.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                });
            }

            for i in 0..ITEMS {
                worker.push(i);
                // Mix owner pops into the interleaving.
                if i % 7 == 0 {
                    if let Some(v) = worker.pop() {
                        sum.fetch_add(v, Ordering::Relaxed);
                        remaining.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
            while let Some(v) = worker.pop() {
                sum.fetch_add(v, Ordering::Relaxed);
                remaining.fetch_sub(1, Ordering::AcqRel);
            }
            // Thieves exit once every element has been accounted for.
        });

        assert_eq!(remaining.load(Ordering::Relaxed), 0);
        assert_eq!(sum.load(Ordering::Relaxed), ITEMS * (ITEMS - 1) / 2);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_capacity() {
        let _ = Worker::<u32>::with_capacity(12);
    }
}
