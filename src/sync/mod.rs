//! Task-aware synchronization primitives.

pub mod semaphore;

pub use semaphore::Semaphore;
