//! Channels for task-to-task communication.
//!
//! [`oneshot`] carries a single value to a single waiter (the session uses
//! one per in-flight request). [`mpsc`] is a bounded multi-producer,
//! single-consumer queue; senders wait for capacity, which is how the
//! session's notify path applies backpressure to a flooding peer.

pub mod mpsc;
pub mod oneshot;
