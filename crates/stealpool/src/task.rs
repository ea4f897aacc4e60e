//! One-shot jobs and their result handles.
//!
//! [`Job`] is the unit the pool queues: a heap-boxed, move-only closure that
//! is consumed by running it. A job produced by [`Job::with_handle`] carries
//! a promise for its matching [`JobHandle`]; the handle resolves exactly once
//! to the returned value, to the captured panic payload, or to
//! [`JoinError::Abandoned`] if the job is dropped before it ever runs.
//! Panics inside a job are always caught on the worker side and never unwind
//! into the pool's run loop.

use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

/// Payload carried out of a panicking job.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Why a [`JobHandle`] resolved without a value.
#[derive(Error)]
pub enum JoinError {
    /// The job body panicked; the payload is the one `panic!` carried.
    #[error("job panicked")]
    Panicked(PanicPayload),
    /// The job was dropped before it ran, e.g. it was still queued when the
    /// pool was torn down.
    #[error("job was dropped before it ran")]
    Abandoned,
}

impl JoinError {
    /// Returns the panic payload, if the job panicked.
    pub fn into_panic(self) -> Option<PanicPayload> {
        match self {
            JoinError::Panicked(payload) => Some(payload),
            JoinError::Abandoned => None,
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(payload) => f
                .debug_tuple("Panicked")
                .field(&panic_message(payload))
                .finish(),
            JoinError::Abandoned => f.pad("Abandoned"),
        }
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

enum State<T> {
    Pending,
    Value(T),
    Panicked(PanicPayload),
    Abandoned,
}

struct Channel<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

/// Receiving side of a job's result. Single use; [`JobHandle::join`]
/// consumes the handle.
pub struct JobHandle<T> {
    chan: Arc<Channel<T>>,
}

impl<T> JobHandle<T> {
    /// Blocks until the job resolves and returns its outcome.
    pub fn join(self) -> Result<T, JoinError> {
        let mut state = self.chan.state.lock().expect("job channel poisoned");
        loop {
            match mem::replace(&mut *state, State::Pending) {
                State::Pending => {
                    state = self.chan.cv.wait(state).expect("job channel poisoned");
                }
                State::Value(value) => return Ok(value),
                State::Panicked(payload) => return Err(JoinError::Panicked(payload)),
                State::Abandoned => return Err(JoinError::Abandoned),
            }
        }
    }

    /// Returns whether the job has resolved, without blocking.
    pub fn is_finished(&self) -> bool {
        let state = self.chan.state.lock().expect("job channel poisoned");
        !matches!(*state, State::Pending)
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("JobHandle { .. }")
    }
}

/// Sending side of the channel. Fulfilled at most once; dropping an
/// unfulfilled promise resolves the handle as abandoned.
struct Promise<T> {
    chan: Arc<Channel<T>>,
    done: bool,
}

impl<T> Promise<T> {
    fn complete(mut self, outcome: State<T>) {
        {
            let mut state = self.chan.state.lock().expect("job channel poisoned");
            *state = outcome;
        }
        self.done = true;
        self.chan.cv.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.chan.state.lock() {
            if matches!(*state, State::Pending) {
                *state = State::Abandoned;
            }
        }
        self.chan.cv.notify_all();
    }
}

/// A move-only, one-shot unit of work.
pub(crate) struct Job(Box<dyn FnOnce() + Send + 'static>);

impl Job {
    /// Wraps `f` into a job that delivers its outcome through the returned
    /// handle. The closure and everything it captures are taken by value.
    pub(crate) fn with_handle<F, R>(f: F) -> (Job, JobHandle<R>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let chan = Arc::new(Channel {
            state: Mutex::new(State::Pending),
            cv: Condvar::new(),
        });
        let handle = JobHandle { chan: chan.clone() };
        let promise = Promise { chan, done: false };

        let job = Job(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => promise.complete(State::Value(value)),
                Err(payload) => promise.complete(State::Panicked(payload)),
            }
        }));
        (job, handle)
    }

    /// Wraps `f` into a fire-and-forget job. A panic in the body is caught
    /// and logged; there is no handle to deliver it to.
    pub(crate) fn detached<F>(f: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        Job(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                tracing::error!("detached job panicked: {}", panic_message(&payload));
            }
        }))
    }

    /// Runs the job, consuming it.
    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Job { .. }")
    }
}
