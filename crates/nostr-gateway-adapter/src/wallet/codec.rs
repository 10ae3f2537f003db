/*
[INPUT]:  Wallet records, the active signer and a relay transport
[OUTPUT]: Encrypted wallet events on relays and decoded records read back from them
[POS]:    Wallet layer - event encoding for kinds 17375 / 7375 / 7376 / 7374 / 5
[UPDATE]: When a wallet event layout changes
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::auth::NostrSigner;
use crate::http::{GatewayError, Result};
use crate::relay::{Filter, RelayTransport};
use crate::types::{
    DeleteTombstone, Kind, PaymentQuote, PublicKey, SignedEvent, SpendingHistoryEntry, Stored,
    TokenSet, UnsignedEvent, WalletConfig,
};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds, publishes and reads wallet events. Content is encrypted to the owner's own key.
pub struct WalletEventCodec {
    signer: Arc<dyn NostrSigner>,
    transport: Arc<dyn RelayTransport>,
    fetch_timeout: Duration,
}

impl WalletEventCodec {
    pub fn new(signer: Arc<dyn NostrSigner>, transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            signer,
            transport,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub async fn owner(&self) -> Result<PublicKey> {
        self.signer.get_public_key().await
    }

    async fn seal(
        &self,
        kind: Kind,
        plaintext: &str,
        public_tags: Vec<Vec<String>>,
    ) -> Result<SignedEvent> {
        let owner = self.owner().await?;
        let content = self.signer.encrypt(&owner, plaintext).await?;
        self.signer
            .sign_event(UnsignedEvent::new(kind, content).tags(public_tags))
            .await
    }

    // ### Builders

    pub async fn encode_wallet_config(&self, config: &WalletConfig) -> Result<SignedEvent> {
        let plaintext = serde_json::to_string(&config.to_tags())?;
        self.seal(Kind::WALLET_CONFIG, &plaintext, Vec::new()).await
    }

    pub async fn encode_token_set(&self, token_set: &TokenSet) -> Result<SignedEvent> {
        let plaintext = serde_json::to_string(token_set)?;
        self.seal(Kind::TOKEN_SET, &plaintext, Vec::new()).await
    }

    pub async fn encode_history(&self, entry: &SpendingHistoryEntry) -> Result<SignedEvent> {
        let plaintext = serde_json::to_string(&entry.encrypted_tags())?;
        self.seal(Kind::SPENDING_HISTORY, &plaintext, entry.public_tags())
            .await
    }

    pub async fn encode_quote(&self, quote: &PaymentQuote) -> Result<SignedEvent> {
        self.seal(Kind::PAYMENT_QUOTE, &quote.quote_id, quote.public_tags())
            .await
    }

    /// Deletion requests are public; only tags are set.
    pub async fn encode_tombstone(&self, tombstone: &DeleteTombstone) -> Result<SignedEvent> {
        self.signer
            .sign_event(UnsignedEvent::new(Kind::DELETION, "").tags(tombstone.to_tags()))
            .await
    }

    async fn publish(&self, event: SignedEvent) -> Result<SignedEvent> {
        self.transport.publish(&event).await?;
        debug!(kind = %event.kind, event = %event.id, "wallet event published");
        Ok(event)
    }

    pub async fn publish_wallet_config(&self, config: &WalletConfig) -> Result<SignedEvent> {
        let event = self.encode_wallet_config(config).await?;
        self.publish(event).await
    }

    pub async fn publish_token_set(&self, token_set: &TokenSet) -> Result<SignedEvent> {
        let event = self.encode_token_set(token_set).await?;
        self.publish(event).await
    }

    pub async fn publish_history(&self, entry: &SpendingHistoryEntry) -> Result<SignedEvent> {
        let event = self.encode_history(entry).await?;
        self.publish(event).await
    }

    pub async fn publish_quote(&self, quote: &PaymentQuote) -> Result<SignedEvent> {
        let event = self.encode_quote(quote).await?;
        self.publish(event).await
    }

    pub async fn publish_tombstone(&self, tombstone: &DeleteTombstone) -> Result<SignedEvent> {
        let event = self.encode_tombstone(tombstone).await?;
        self.publish(event).await
    }

    // ### Readers

    async fn fetch_own(&self, kind: Kind) -> Result<Vec<SignedEvent>> {
        let owner = self.owner().await?;
        let filter = Filter::new().kind(kind).author(owner);
        self.transport.fetch(filter, self.fetch_timeout).await
    }

    // undecryptable or malformed events are skipped
    async fn fetch_decoded<T, F>(&self, kind: Kind, decode: F) -> Result<Vec<Stored<T>>>
    where
        F: Fn(&SignedEvent, &str) -> Result<T>,
    {
        let owner = self.owner().await?;
        let mut records = Vec::new();
        for event in self.fetch_own(kind).await? {
            let plaintext = match self.signer.decrypt(&owner, &event.content).await {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    warn!(kind = %kind, event = %event.id, error = %err, "skipping undecryptable wallet event");
                    continue;
                }
            };
            match decode(&event, &plaintext) {
                Ok(record) => records.push(Stored {
                    event_id: event.id,
                    created_at: event.created_at,
                    record,
                }),
                Err(err) => {
                    warn!(kind = %kind, event = %event.id, error = %err, "skipping malformed wallet event");
                }
            }
        }
        Ok(records)
    }

    /// Newest readable wallet config
    pub async fn fetch_wallet_config(&self) -> Result<Option<Stored<WalletConfig>>> {
        let configs = self
            .fetch_decoded(Kind::WALLET_CONFIG, |_, plaintext| {
                let tags: Vec<Vec<String>> = serde_json::from_str(plaintext)?;
                WalletConfig::from_tags(&tags)
            })
            .await?;
        Ok(configs.into_iter().max_by_key(|stored| stored.created_at))
    }

    pub async fn fetch_token_sets(&self) -> Result<Vec<Stored<TokenSet>>> {
        self.fetch_decoded(Kind::TOKEN_SET, |_, plaintext| {
            Ok(serde_json::from_str::<TokenSet>(plaintext)?)
        })
        .await
    }

    pub async fn fetch_history(&self) -> Result<Vec<Stored<SpendingHistoryEntry>>> {
        self.fetch_decoded(Kind::SPENDING_HISTORY, |event, plaintext| {
            let encrypted: Vec<Vec<String>> = serde_json::from_str(plaintext)?;
            SpendingHistoryEntry::from_tags(&encrypted, &event.tags)
        })
        .await
    }

    /// Quotes that have not expired yet
    pub async fn fetch_quotes(&self) -> Result<Vec<Stored<PaymentQuote>>> {
        let now = Utc::now().timestamp().max(0) as u64;
        let quotes = self.fetch_decoded(Kind::PAYMENT_QUOTE, decode_quote).await?;
        Ok(quotes
            .into_iter()
            .filter(|stored| !stored.record.is_expired_at(now))
            .collect())
    }

    /// Deletion requests targeting token sets
    pub async fn fetch_tombstones(&self) -> Result<Vec<DeleteTombstone>> {
        let mut tombstones = Vec::new();
        for event in self.fetch_own(Kind::DELETION).await? {
            match DeleteTombstone::from_event(&event) {
                Ok(tombstone) if tombstone.target_kind == Kind::TOKEN_SET => tombstones.push(tombstone),
                Ok(_) => {}
                Err(err) => warn!(event = %event.id, error = %err, "skipping malformed deletion"),
            }
        }
        Ok(tombstones)
    }
}

fn decode_quote(event: &SignedEvent, plaintext: &str) -> Result<PaymentQuote> {
    let mint = event
        .tag_value("mint")
        .ok_or_else(|| GatewayError::InvalidResponse("quote without mint tag".into()))?;
    let expires_at = event
        .tag_value("expiration")
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| GatewayError::InvalidResponse("quote without expiration".into()))?;
    Ok(PaymentQuote {
        quote_id: plaintext.to_string(),
        mint: mint.to_string(),
        expires_at,
    })
}

impl std::fmt::Debug for WalletEventCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletEventCodec")
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}
