//! Utility types shared among engine components.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal that fans out from the engine to its listeners and
/// sessions.
///
/// Cloning yields another handle to the same signal; [`Shutdown::wait`]
/// completes once [`Shutdown::shutdown`] has been called on any handle,
/// including calls made before the waiter subscribed. Used to stop accept
/// loops, abandon in-flight splice I/O, and wind the reaper down.
#[derive(Clone)]
pub struct Shutdown {
    state: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Construct a new, un-fired [`Shutdown`] signal.
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(false).0),
        }
    }

    /// Fire the signal, waking every task blocked in [`Shutdown::wait`].
    /// Idempotent.
    pub fn shutdown(&self) {
        self.state.send_replace(true);
    }

    /// Resolve once the signal has fired; immediately if it already has.
    pub fn wait(&self) -> impl Future<Output = ()> + Send {
        let mut rx = self.state.subscribe();
        async move {
            // An error means every handle is gone, which only happens during
            // teardown; treat it the same as a fired signal.
            rx.wait_for(|fired| *fired).await.ok();
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("fired", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_shutdown() {
        let signal = Shutdown::new();
        let waiter = signal.wait();
        signal.shutdown();
        waiter.await;
    }

    #[tokio::test]
    async fn wait_resolves_when_already_fired() {
        let signal = Shutdown::new();
        signal.shutdown();
        signal.shutdown();
        signal.wait().await;
        // Clones observe the same signal.
        signal.clone().wait().await;
    }
}
