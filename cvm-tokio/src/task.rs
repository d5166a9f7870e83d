//! A thin wrapper around [`tokio::task::JoinHandle`] that names every spawned
//! task and propagates panics to whoever joins it, instead of swallowing them
//! in a [`JoinError`]. Transports join their pump tasks on `stop()`, so a
//! panicking pump surfaces at the callsite that can actually report it.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// A named task handle.
///
/// `#[must_use]`: either join the task or explicitly [`detach`](Task::detach)
/// it. Detaching should be rare; orphaned tasks hide panics and leak work
/// past shutdown.
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> Task<T> {
    /// Spawns a named task onto the current runtime.
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Task {
            handle: tokio::spawn(future),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Drops the handle so the task keeps running unsupervised.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = result.map_err(|join_err| {
            match join_err.try_into_panic() {
                // Resurface the panic at the joiner.
                Ok(reason) => {
                    tracing::error!(
                        "Task '{name}' panicked",
                        name = self.name,
                    );
                    std::panic::resume_unwind(reason)
                }
                Err(join_err) => join_err,
            }
        });

        Poll::Ready(result)
    }
}
