use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};
use tracing::{info_span, Instrument};

/// A thin wrapper around [`tokio::task::JoinHandle`] that adds the
/// `#[must_use]` lint to ensure that all spawned tasks are joined or
/// explicitly annotated that no joining is required.
#[must_use]
pub struct LxTask<T>(JoinHandle<T>);

impl<T> LxTask<T> {
    #[allow(clippy::disallowed_methods)]
    pub fn spawn<F>(future: F) -> LxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    /// Like [`Self::spawn`], but instruments the task with an
    /// [`info_span`] of the given name. Makes it easier to tell which task
    /// emitted a given log line when multiple instances of the same state
    /// machine are running concurrently.
    #[allow(clippy::disallowed_methods)]
    pub fn spawn_named<F>(name: &'static str, future: F) -> LxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self(tokio::spawn(future.instrument(info_span!("", %name))))
    }
}

impl<T> Future for LxTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}
