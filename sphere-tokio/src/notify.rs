//! A coalescing notification channel.
//!
//! Wraps a capacity-1 [`tokio::sync::mpsc`] so that any number of `send`s
//! before the receiver wakes collapse into a single notification. Used to
//! schedule work ("the buffer changed, flush it") without queueing duplicate
//! work items.

use tokio::sync::mpsc;

/// Create a new notify channel: a cloneable [`Sender`] and a [`Receiver`].
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(1);
    (Sender(tx), Receiver(rx))
}

#[derive(Clone)]
pub struct Sender(mpsc::Sender<()>);

pub struct Receiver(mpsc::Receiver<()>);

impl Sender {
    /// Notify the receiver. A no-op if a notification is already pending or
    /// the receiver is gone.
    pub fn send(&self) {
        let _ = self.0.try_send(());
    }
}

impl Receiver {
    /// Waits until a notification is received. Completes immediately if one
    /// is already pending. NOTE: if all [`Sender`]s have been dropped, this
    /// future never completes.
    pub async fn recv(&mut self) {
        match self.0.recv().await {
            Some(()) => (),
            None => std::future::pending().await,
        }
    }

    /// Immediately returns whether a notification is pending, consuming it.
    #[must_use]
    pub fn try_recv(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn multiple_sends_coalesce() {
        let (tx, mut rx) = channel();
        tx.send();
        tx.send();
        tx.send();
        assert!(rx.try_recv());
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn recv_sees_prior_send() {
        let (tx, mut rx) = channel();
        tx.send();
        rx.recv().await;
    }
}
