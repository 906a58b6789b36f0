//! A thin wrapper around [`tokio::task::JoinHandle`] that (1) propagates
//! panics instead of swallowing them and (2) adds `#[must_use]` so spawned
//! tasks are either joined or explicitly detached. Tasks carry a name for
//! debuggability; awaiting the handle logs how the task finished.

use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// A named task handle. See the module docs.
#[must_use]
pub struct SpTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> SpTask<T> {
    /// Spawns a named task which inherits the current tracing span.
    #[inline]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> SpTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        let span = tracing::Span::current();
        SpTask {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle, letting the task run detached in the background.
    /// Use sparingly: a detached task can no longer report its panics.
    #[inline]
    pub fn detach(self) {
        drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Await the task and log how it finished, discarding the output.
    pub async fn join_and_log(self) {
        let name = self.name.clone();
        match self.await {
            Ok(_) => info!("Task '{name}' finished"),
            Err(e) if e.is_cancelled() => warn!("Task '{name}' cancelled"),
            Err(e) => warn!("Task '{name}' join error: {e:#}"),
        }
    }
}

impl<T> Future for SpTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // Propagate the panic to whoever is polling us.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

impl<T> fmt::Debug for SpTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpTask({})", self.name)
    }
}
