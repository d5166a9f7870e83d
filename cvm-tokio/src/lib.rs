//! Tokio scaffolding shared by the transports: named task handles, a one-shot
//! signal channel, and a concurrency-limited background work queue.

/// `NotifyOnce`, used for shutdown signals and payment-verification aborts.
pub mod notify_once;
/// Concurrency-limited background work queue.
pub mod queue;
/// Named task handles with panic propagation.
pub mod task;

pub use notify_once::NotifyOnce;
pub use queue::TaskQueue;
pub use task::Task;
