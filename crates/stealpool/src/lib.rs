//! Work-stealing thread pool over lock-free per-worker deques.
//!
//! Each worker thread owns a Chase-Lev deque and a lightweight counting
//! semaphore. Submissions are distributed round-robin across the deques and
//! wake the matching worker; idle workers steal from randomly chosen peers.
//! The API surface is intentionally small so higher level schedulers can be
//! built on top.

pub mod deque;
pub mod pool;
pub mod rng;
pub mod semaphore;
pub mod task;

pub use pool::{Builder, ThreadPool};
pub use semaphore::Semaphore;
pub use task::{JobHandle, JoinError};
