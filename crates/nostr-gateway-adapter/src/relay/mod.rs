/*
[INPUT]:  Signed events to publish and filters to query
[OUTPUT]: Stored events and live subscriptions from relays
[POS]:    Relay layer - transport abstraction shared by signer RPC and wallet sync
[UPDATE]: When the transport surface changes
*/

pub mod client;
pub mod memory;
pub mod message;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::http::Result;
use crate::types::SignedEvent;

pub use client::{RelayClient, RelayConfig};
pub use memory::MemoryRelay;
pub use message::{ClientMessage, Filter, RelayMessage};

/// Live subscription handle. Events arrive on `events` until `unsubscribe`.
#[derive(Debug)]
pub struct RelaySubscription {
    pub id: String,
    pub events: mpsc::Receiver<SignedEvent>,
}

/// Publish/fetch/subscribe over one or more relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Publish to every connected relay. Succeeds if at least one accepts.
    async fn publish(&self, event: &SignedEvent) -> Result<()>;

    /// Stored events matching `filter`, de-duplicated, newest first.
    async fn fetch(&self, filter: Filter, timeout: Duration) -> Result<Vec<SignedEvent>>;

    async fn subscribe(&self, filter: Filter) -> Result<RelaySubscription>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Connect additional relays (already known ones are ignored).
    async fn add_relays(&self, relays: &[Url]) -> Result<()>;
}

pub(crate) fn newest_first(mut events: Vec<SignedEvent>, limit: Option<usize>) -> Vec<SignedEvent> {
    let mut seen = std::collections::HashSet::new();
    events.retain(|event| seen.insert(event.id));
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = limit {
        events.truncate(limit);
    }
    events
}
