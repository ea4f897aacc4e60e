//! Lightweight counting semaphore.
//!
//! An atomic counter fronts a kernel semaphore so the uncontended paths
//! never enter the kernel. The counter is the number of available permits
//! when positive; a negative value `-k` means `k` waiters are parked on the
//! kernel primitive. [`Semaphore::acquire_many`] consumes every permit
//! present at some point during the call with a single wakeup, which lets a
//! consumer drain a burst of notifications without one kernel transition
//! per permit.

use std::sync::atomic::{compiler_fence, AtomicIsize, Ordering};

use crossbeam_utils::CachePadded;

/// CAS attempts before a failed acquire parks on the kernel primitive.
const SPIN_LIMIT: usize = 10_000;

/// Platform kernel semaphore with `wait`, `signal` and bulk `signal(n)`.
mod sys {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    mod imp {
        use std::cell::UnsafeCell;
        use std::io;
        use std::mem::MaybeUninit;

        pub(crate) struct KernelSemaphore {
            // Boxed so the `sem_t` never moves after `sem_init`.
            sem: Box<UnsafeCell<libc::sem_t>>,
        }

        unsafe impl Send for KernelSemaphore {}
        unsafe impl Sync for KernelSemaphore {}

        impl KernelSemaphore {
            pub(crate) fn new() -> KernelSemaphore {
                let sem: Box<UnsafeCell<libc::sem_t>> =
                    Box::new(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }));
                let rc = unsafe { libc::sem_init(sem.get(), 0, 0) };
                assert_eq!(rc, 0, "sem_init failed: {}", io::Error::last_os_error());
                KernelSemaphore { sem }
            }

            pub(crate) fn wait(&self) {
                loop {
                    if unsafe { libc::sem_wait(self.sem.get()) } == 0 {
                        return;
                    }
                    // Restart on EINTR; a debugger or signal delivery must
                    // not count as a wakeup.
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        panic!("sem_wait failed: {err}");
                    }
                }
            }

            pub(crate) fn signal(&self, mut count: usize) {
                while count > 0 {
                    let rc = unsafe { libc::sem_post(self.sem.get()) };
                    assert_eq!(rc, 0, "sem_post failed: {}", io::Error::last_os_error());
                    count -= 1;
                }
            }
        }

        impl Drop for KernelSemaphore {
            fn drop(&mut self) {
                unsafe {
                    libc::sem_destroy(self.sem.get());
                }
            }
        }
    }

    #[cfg(windows)]
    mod imp {
        use std::io;
        use std::ptr;

        use winapi::um::handleapi::CloseHandle;
        use winapi::um::synchapi::{CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObject};
        use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
        use winapi::um::winnt::HANDLE;

        pub(crate) struct KernelSemaphore {
            handle: HANDLE,
        }

        unsafe impl Send for KernelSemaphore {}
        unsafe impl Sync for KernelSemaphore {}

        impl KernelSemaphore {
            pub(crate) fn new() -> KernelSemaphore {
                let handle =
                    unsafe { CreateSemaphoreW(ptr::null_mut(), 0, i32::MAX, ptr::null()) };
                assert!(
                    !handle.is_null(),
                    "CreateSemaphore failed: {}",
                    io::Error::last_os_error()
                );
                KernelSemaphore { handle }
            }

            pub(crate) fn wait(&self) {
                let rc = unsafe { WaitForSingleObject(self.handle, INFINITE) };
                assert_eq!(
                    rc,
                    WAIT_OBJECT_0,
                    "WaitForSingleObject failed: {}",
                    io::Error::last_os_error()
                );
            }

            pub(crate) fn signal(&self, count: usize) {
                if count == 0 {
                    return;
                }
                let rc = unsafe {
                    ReleaseSemaphore(self.handle, count as i32, ptr::null_mut())
                };
                assert_ne!(
                    rc,
                    0,
                    "ReleaseSemaphore failed: {}",
                    io::Error::last_os_error()
                );
            }
        }

        impl Drop for KernelSemaphore {
            fn drop(&mut self) {
                unsafe {
                    CloseHandle(self.handle);
                }
            }
        }
    }

    // Unnamed POSIX semaphores are unavailable on macOS, so everything that
    // is neither Linux nor Windows blocks on a mutex and condvar instead.
    #[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
    mod imp {
        use std::sync::{Condvar, Mutex};

        pub(crate) struct KernelSemaphore {
            count: Mutex<usize>,
            cv: Condvar,
        }

        impl KernelSemaphore {
            pub(crate) fn new() -> KernelSemaphore {
                KernelSemaphore {
                    count: Mutex::new(0),
                    cv: Condvar::new(),
                }
            }

            pub(crate) fn wait(&self) {
                let mut count = self.count.lock().expect("semaphore mutex poisoned");
                while *count == 0 {
                    count = self.cv.wait(count).expect("semaphore condvar poisoned");
                }
                *count -= 1;
            }

            pub(crate) fn signal(&self, n: usize) {
                let mut count = self.count.lock().expect("semaphore mutex poisoned");
                *count += n;
                drop(count);
                for _ in 0..n {
                    self.cv.notify_one();
                }
            }
        }
    }

    pub(crate) use imp::KernelSemaphore;
}

/// Counting semaphore with a lock-free fast path.
pub struct Semaphore {
    count: CachePadded<AtomicIsize>,
    kernel: sys::KernelSemaphore,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` permits.
    ///
    /// # Panics
    ///
    /// Panics if `initial` is negative.
    pub fn new(initial: isize) -> Semaphore {
        assert!(initial >= 0, "initial permit count must be non-negative");
        Semaphore {
            count: CachePadded::new(AtomicIsize::new(initial)),
            kernel: sys::KernelSemaphore::new(),
        }
    }

    /// Adds `n` permits, waking at most `min(n, parked)` waiters.
    ///
    /// The `Release` on the counter publishes everything written before the
    /// release to whichever thread acquires the permit.
    pub fn release(&self, n: isize) {
        debug_assert!(n > 0);
        let old = self.count.fetch_add(n, Ordering::Release);
        let to_wake = n.min((-old).max(0));
        if to_wake > 0 {
            self.kernel.signal(to_wake as usize);
        }
    }

    /// Consumes one permit, parking on the kernel primitive if none is
    /// available after the spin phase.
    pub fn acquire(&self) {
        for _ in 0..SPIN_LIMIT {
            let old = self.count.load(Ordering::Relaxed);
            if old > 0
                && self
                    .count
                    .compare_exchange(old, old - 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            // Keep the optimizer from collapsing the spin into one load.
            compiler_fence(Ordering::Acquire);
        }

        let old = self.count.fetch_sub(1, Ordering::Acquire);
        if old <= 0 {
            self.kernel.wait();
        }
    }

    /// Consumes every permit present at some point during the call, at
    /// least one, blocking if none is available after the spin phase.
    ///
    /// A consumer fed by many single-permit releases drains the whole burst
    /// here with a single wakeup. The counter going to `old - 1` before the
    /// kernel wait records this thread as a parked waiter; the matching
    /// `release` sees the negative value and issues one kernel signal.
    pub fn acquire_many(&self) {
        for _ in 0..SPIN_LIMIT {
            let old = self.count.load(Ordering::Relaxed);
            if old > 0
                && self
                    .count
                    .compare_exchange(old, 0, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            compiler_fence(Ordering::Acquire);
        }

        let mut old = self.count.load(Ordering::Relaxed);
        loop {
            if old <= 0 {
                match self.count.compare_exchange(
                    old,
                    old - 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.kernel.wait();
                        break;
                    }
                    Err(current) => old = current,
                }
            } else {
                match self
                    .count
                    .compare_exchange(old, 0, Ordering::AcqRel, Ordering::Relaxed)
                {
                    Ok(_) => return,
                    Err(current) => old = current,
                }
            }
        }

        // Woken by a release. Opportunistically take whatever accumulated
        // while this thread slept.
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self
                .count
                .compare_exchange(current, 0, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Snapshot of the permit counter. Negative values count parked
    /// waiters. Advisory only.
    pub fn available(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.available())
            .finish()
    }
}
