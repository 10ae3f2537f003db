/*
[INPUT]:  Events and filters from in-process callers
[OUTPUT]: A single in-memory relay with live subscriptions and injectable failures
[POS]:    Relay layer - offline transport for tests and local runs
[UPDATE]: When the RelayTransport trait changes
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::{Filter, RelaySubscription, RelayTransport, newest_first};
use crate::http::{GatewayError, Result};
use crate::types::{Kind, SignedEvent};

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<SignedEvent>,
    subscriptions: HashMap<String, (Filter, mpsc::Sender<SignedEvent>)>,
    failing_kinds: HashSet<Kind>,
    relays: Vec<Url>,
}

/// In-process relay. Verifies events on publish like a real relay would.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    state: Mutex<MemoryState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every publish of `kind` fail until `restore_publish` is called.
    pub fn fail_publish(&self, kind: Kind) {
        self.state().failing_kinds.insert(kind);
    }

    pub fn restore_publish(&self, kind: Kind) {
        self.state().failing_kinds.remove(&kind);
    }

    pub fn events(&self) -> Vec<SignedEvent> {
        self.state().events.clone()
    }

    pub fn events_of_kind(&self, kind: Kind) -> Vec<SignedEvent> {
        self.state()
            .events
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Relays handed to `add_relays`, in order.
    pub fn known_relays(&self) -> Vec<Url> {
        self.state().relays.clone()
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn publish(&self, event: &SignedEvent) -> Result<()> {
        event
            .verify()
            .map_err(|e| GatewayError::NetworkOrRelay(format!("invalid: {e}")))?;

        let mut state = self.state();
        if state.failing_kinds.contains(&event.kind) {
            return Err(GatewayError::NetworkOrRelay(format!(
                "publish of kind {} rejected",
                event.kind
            )));
        }
        if state.events.iter().any(|stored| stored.id == event.id) {
            return Ok(());
        }
        state.events.push(event.clone());
        state.subscriptions.retain(|id, (filter, sender)| {
            if !filter.matches(event) {
                return true;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscription = %id, "subscription buffer full, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    async fn fetch(&self, filter: Filter, _timeout: Duration) -> Result<Vec<SignedEvent>> {
        let matching = self
            .state()
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        Ok(newest_first(matching, filter.limit))
    }

    async fn subscribe(&self, filter: Filter) -> Result<RelaySubscription> {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.state();
        for event in state.events.iter().filter(|event| filter.matches(event)) {
            let _ = tx.try_send(event.clone());
        }
        state.subscriptions.insert(id.clone(), (filter, tx));
        Ok(RelaySubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.state().subscriptions.remove(subscription_id);
        Ok(())
    }

    async fn add_relays(&self, relays: &[Url]) -> Result<()> {
        let mut state = self.state();
        for relay in relays {
            if !state.relays.contains(relay) {
                state.relays.push(relay.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Keys;
    use crate::types::UnsignedEvent;
    use tokio_test::assert_ok;

    fn event(keys: &Keys, kind: Kind, created_at: u64) -> SignedEvent {
        keys.sign_event(UnsignedEvent::new(kind, "c").created_at(created_at))
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_fetch_newest_first() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        assert_ok!(relay.publish(&event(&keys, Kind::TOKEN_SET, 10)).await);
        assert_ok!(relay.publish(&event(&keys, Kind::TOKEN_SET, 20)).await);
        assert_ok!(relay.publish(&event(&keys, Kind::SPENDING_HISTORY, 30)).await);

        let fetched = relay
            .fetch(Filter::new().kind(Kind::TOKEN_SET), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].created_at, 20);
    }

    #[tokio::test]
    async fn test_rejects_invalid_events() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        let mut forged = event(&keys, Kind::TOKEN_SET, 10);
        forged.content = "changed".into();
        assert!(matches!(
            relay.publish(&forged).await,
            Err(GatewayError::NetworkOrRelay(_))
        ));
        assert!(relay.events().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_per_kind() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        relay.fail_publish(Kind::DELETION);
        assert!(relay.publish(&event(&keys, Kind::DELETION, 1)).await.is_err());
        assert_ok!(relay.publish(&event(&keys, Kind::TOKEN_SET, 1)).await);

        relay.restore_publish(Kind::DELETION);
        assert_ok!(relay.publish(&event(&keys, Kind::DELETION, 2)).await);
    }

    #[tokio::test]
    async fn test_subscription_receives_stored_and_live_events() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        relay.publish(&event(&keys, Kind::NOSTR_CONNECT, 1)).await.unwrap();

        let mut sub = relay
            .subscribe(Filter::new().kind(Kind::NOSTR_CONNECT))
            .await
            .unwrap();
        relay.publish(&event(&keys, Kind::NOSTR_CONNECT, 2)).await.unwrap();
        relay.publish(&event(&keys, Kind::TOKEN_SET, 3)).await.unwrap();

        assert_eq!(sub.events.recv().await.unwrap().created_at, 1);
        assert_eq!(sub.events.recv().await.unwrap().created_at, 2);
        assert!(sub.events.try_recv().is_err());

        relay.unsubscribe(&sub.id).await.unwrap();
        assert_eq!(relay.subscription_count(), 0);
    }
}
