//! Concurrency-limited background work queue.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::task::Task;

/// Runs background jobs (re-announcements, progress pumps) with a fixed bound
/// on parallelism. Jobs submitted past the bound queue up on the internal
/// semaphore; a width-1 queue serializes its jobs.
///
/// [`close`](Self::close) makes the queue drop any job that has not yet
/// started; jobs already running are unaffected.
#[derive(Clone)]
pub struct TaskQueue {
    sem: Arc<Semaphore>,
}

impl TaskQueue {
    pub const DEFAULT_WIDTH: usize = 5;

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_width(Self::DEFAULT_WIDTH)
    }

    pub fn with_width(width: usize) -> Self {
        assert!(width > 0, "TaskQueue width must be positive");
        Self {
            sem: Arc::new(Semaphore::new(width)),
        }
    }

    /// Submits a job. The returned handle may be joined or detached; the
    /// job itself starts once a permit frees up.
    pub fn spawn<F>(
        &self,
        name: impl Into<Cow<'static, str>>,
        job: F,
    ) -> Task<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sem = self.sem.clone();
        let name = name.into();
        Task::spawn(name.clone(), async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_closed) => {
                    debug!("Queue closed; dropping job: {name}");
                    return;
                }
            };
            job.await;
        })
    }

    /// Stops admitting queued jobs. Running jobs finish normally.
    pub fn close(&self) {
        self.sem.close();
    }
}
