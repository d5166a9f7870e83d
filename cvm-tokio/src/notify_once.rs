//! One-shot broadcast signal.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A one-shot signal observable by any number of waiters, used for transport
/// shutdown and as the abort signal handed to payment verifiers.
///
/// - Clone freely; all clones observe the same signal.
/// - [`recv`](Self::recv) completes immediately if the signal was already
///   sent, including for clones created after the fact.
/// - Sending more than once is harmless.
///
/// Implementation: a [`Semaphore`] with zero permits. `acquire` on such a
/// semaphore can only ever fail, and it fails exactly when the semaphore is
/// closed; closing is sending the signal.
#[derive(Clone, Debug)]
pub struct NotifyOnce {
    sem: Arc<Semaphore>,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(0)),
        }
    }

    /// Fire the signal. All current and future `recv` calls complete.
    pub fn send(&self) {
        self.sem.close();
    }

    /// Wait for the signal. Completes immediately if already fired.
    pub async fn recv(&self) {
        match self.sem.acquire().await {
            // No permits exist, so acquiring one is impossible.
            Ok(_permit) =>
                unreachable!("acquired a permit from an empty semaphore"),
            Err(_closed) => (),
        }
    }

    /// Whether the signal has fired, without waiting.
    pub fn is_sent(&self) -> bool {
        self.sem.is_closed()
    }
}
