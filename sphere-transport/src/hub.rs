//! An in-memory relay hub.
//!
//! Behaves like a single relay shared by every wallet in the process: stores
//! events, replaces parameterized-replaceable ones, answers queries, and fans
//! out live events to subscribers. Backs tests and single-process setups.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::event::{Filter, WireEvent};

#[derive(Clone)]
pub struct MemRelayHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    events: Mutex<Vec<WireEvent>>,
    live_tx: broadcast::Sender<WireEvent>,
}

impl Default for MemRelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRelayHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                events: Mutex::new(Vec::new()),
                live_tx: broadcast::channel(sphere_tokio::DEFAULT_CHANNEL_SIZE).0,
            }),
        }
    }

    /// Store an event and fan it out to live subscribers.
    pub fn publish(&self, event: WireEvent) {
        {
            let mut events = self.inner.events.lock().unwrap();
            if event.kind.is_replaceable() {
                // Latest (pubkey, d-tag) instance wins; drop older ones.
                let d = event.tag_value("d").map(str::to_owned);
                events.retain(|existing| {
                    !(existing.kind == event.kind
                        && existing.pubkey == event.pubkey
                        && existing.tag_value("d").map(str::to_owned) == d
                        && existing.created_at <= event.created_at)
                });
            }
            // At-least-once being the delivery contract, duplicates are fine,
            // but there's no point storing exact copies.
            if !events.iter().any(|existing| existing.id == event.id) {
                events.push(event.clone());
            }
        }
        let _ = self.inner.live_tx.send(event);
    }

    /// All stored events matching any of `filters`.
    pub fn query(&self, filters: &[Filter]) -> Vec<WireEvent> {
        self.inner
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| filters.iter().any(|f| f.matches(event)))
            .cloned()
            .collect()
    }

    /// Subscribe to live events (no replay of stored ones).
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.inner.live_tx.subscribe()
    }

    pub fn event_count(&self) -> usize {
        self.inner.events.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use sphere_common::{root_seed::RootSeed, time::TimestampMs};

    use super::*;
    use crate::event::{EventKind, Tag};

    fn keypair(byte: u8) -> sphere_common::root_seed::ChainKeypair {
        RootSeed::try_from([byte; 32].as_slice())
            .unwrap()
            .derive_transport_keypair(0)
    }

    fn ev(kp: &sphere_common::root_seed::ChainKeypair, kind: EventKind, d: &str, at: i64) -> WireEvent {
        WireEvent::build(
            kp,
            kind,
            vec![Tag::d(d)],
            format!("content at {at}"),
            TimestampMs::from_ms(at).unwrap(),
        )
    }

    #[test]
    fn replaceable_events_replace() {
        let hub = MemRelayHub::new();
        let kp = keypair(1);
        hub.publish(ev(&kp, EventKind::IdentityBinding, "slot", 1));
        hub.publish(ev(&kp, EventKind::IdentityBinding, "slot", 2));
        assert_eq!(hub.event_count(), 1);

        let results = hub.query(&[Filter::new().kind(EventKind::IdentityBinding)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].created_at.as_i64(), 2);
    }

    #[test]
    fn different_slots_coexist() {
        let hub = MemRelayHub::new();
        let kp = keypair(1);
        hub.publish(ev(&kp, EventKind::IdentityBinding, "a", 1));
        hub.publish(ev(&kp, EventKind::IdentityBinding, "b", 1));
        assert_eq!(hub.event_count(), 2);
    }

    #[test]
    fn duplicate_publish_stores_once() {
        let hub = MemRelayHub::new();
        let event = ev(&keypair(1), EventKind::TokenTransfer, "x", 1);
        hub.publish(event.clone());
        hub.publish(event);
        assert_eq!(hub.event_count(), 1);
    }

    #[tokio::test]
    async fn live_fanout() {
        let hub = MemRelayHub::new();
        let mut rx = hub.subscribe();
        let event = ev(&keypair(1), EventKind::TokenTransfer, "x", 1);
        hub.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
