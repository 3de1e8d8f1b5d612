use std::sync::Arc;

use tokio::sync::Semaphore;

/// A synchronization utility designed for sending / receiving shutdown
/// signals.
///
/// Features:
///
/// - Multi-producer and multi-consumer - simply clone to get another handle
/// - Consumers can receive shutdown signals that were sent prior to
///   'subscribing' to the channel (unlike [`tokio::sync::broadcast`]);
/// - It is safe to send a shutdown signal multiple times (e.g. by accident).
///
/// The underlying implementation (ab)uses the fact that calling [`acquire`]
/// on a [`Semaphore`] with 0 permits only returns once the [`Semaphore`] has
/// been closed. Closing the [`Semaphore`] is equivalent to sending a shutdown
/// signal, and receiving an [`AcquireError`] (indicating the [`Semaphore`]
/// has been closed) from a call to [`acquire`] is equivalent to receiving
/// one. [`ShutdownChannel`]'s methods abstract over these details.
///
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
}

impl ShutdownChannel {
    /// Construct a new [`ShutdownChannel`]. This should be called once per
    /// process and its handles cloned out to every long-lived task.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let inner = Arc::new(Semaphore::new(0));
        Self { inner }
    }

    /// Send a shutdown signal, causing all actors waiting on this channel to
    /// complete their call to [`recv`].
    ///
    /// [`recv`]: ShutdownChannel::recv
    pub fn send(&self) {
        self.inner.close()
    }

    /// Wait for a shutdown signal.
    /// If a shutdown signal was already sent, this fn returns immediately.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map_err(|_| ())
            .expect_err("Shouldn't've been able to acquire a permit")
    }

    /// Immediately returns whether a shutdown signal has been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}
