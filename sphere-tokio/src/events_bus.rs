//! A broadcast-backed events bus.
//!
//! Producers call [`EventsBus::notify`]; consumers [`subscribe`] then await
//! events matching a filter. Notifying with no subscribers is a no-op, and
//! slow subscribers lag rather than blocking producers.
//!
//! [`subscribe`]: EventsBus::subscribe

use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventsBus<T> {
    event_tx: broadcast::Sender<T>,
}

impl<T: Clone> EventsBus<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            event_tx: broadcast::channel(crate::DEFAULT_CHANNEL_SIZE).0,
        }
    }

    /// Send an event onto the bus. A no-op if there are no subscribers.
    pub fn notify(&self, event: T) {
        let _ = self.event_tx.send(event);
    }

    /// Start listening to events notified after this point.
    pub fn subscribe(&self) -> EventsRx<'_, T> {
        EventsRx {
            _event_tx: &self.event_tx,
            event_rx: self.event_tx.subscribe(),
        }
    }
}

pub struct EventsRx<'a, T> {
    // Held so the channel can't shut down while we're waiting.
    _event_tx: &'a broadcast::Sender<T>,
    event_rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<'_, T> {
    /// Wait for the next event that makes `filter` return true. Waits
    /// indefinitely; wrap in a timeout at the callsite.
    pub async fn next_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) =>
                    if filter(&event) {
                        return event;
                    },
                Err(RecvError::Closed) => unreachable!(
                    "we hold a sender handle, the channel cannot close"
                ),
                // Lagged behind; nothing to do but keep draining.
                Err(RecvError::Lagged(_)) => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn filtered_recv_skips_non_matching() {
        let bus = EventsBus::<u32>::new();
        let mut rx = bus.subscribe();
        bus.notify(1);
        bus.notify(2);
        bus.notify(3);
        assert_eq!(rx.next_filtered(|x| *x >= 3).await, 3);
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_noop() {
        let bus = EventsBus::<u32>::new();
        bus.notify(42);
    }
}
