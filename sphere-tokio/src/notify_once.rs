//! A one-shot multi-producer multi-consumer signal, used for shutdown.
//!
//! Unlike [`tokio::sync::broadcast`], consumers observe a signal that was
//! sent before they subscribed, and sending twice is harmless. The
//! implementation rides on the fact that acquiring from a zero-permit
//! [`Semaphore`] only returns once the semaphore has been closed: `send`
//! closes it, and the resulting `AcquireError` is the received signal.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct NotifyOnce {
    inner: Arc<Semaphore>,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Send the signal. All current and future `recv` calls complete.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal. Returns immediately if it was already sent.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map(|_| ())
            .expect_err("zero-permit semaphore can only close, never acquire");
    }

    /// Waits for the signal, taking ownership of the handle. Useful for APIs
    /// which require `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(self) {
        self.recv().await
    }

    /// Immediately returns whether the signal has been sent.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn multiple_sends_dont_panic() {
        let shutdown = NotifyOnce::new();
        shutdown.send();
        shutdown.send();
        shutdown.send();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_send_is_ok() {
        let shutdown1 = NotifyOnce::new();
        let shutdown2 = shutdown1.clone();
        time::sleep(Duration::from_secs(1)).await;
        shutdown1.send();
        time::timeout(Duration::from_nanos(1), shutdown2.recv())
            .await
            .expect("Did not finish immediately");

        // 'Subscribing' after the signal should also complete immediately.
        let shutdown3 = shutdown2.clone();
        assert!(shutdown3.try_recv());
        time::timeout(Duration::from_nanos(1), shutdown3.recv())
            .await
            .expect("Did not finish immediately");
    }
}
