/*
[INPUT]:  Active signer, relay transport, proofs from the mint protocol
[OUTPUT]: Wallet balances, spend/receive outcomes and history
[POS]:    Wallet layer - encrypted e-cash ledger on relays
[UPDATE]: When wallet operations or event kinds change
*/

pub mod codec;
pub mod reconciler;
pub mod state;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::auth::{Keys, NostrSigner};
use crate::http::{GatewayError, Result};
use crate::relay::RelayTransport;
use crate::types::{EventId, Proof, SpendingHistoryEntry, Stored, WalletConfig};

pub use codec::{DEFAULT_FETCH_TIMEOUT, WalletEventCodec};
pub use reconciler::{
    ReceiveRequest, ReconcileOutcome, ReconcileWarning, SpendRequest, SpendingReconciler,
};
pub use state::WalletState;

/// Codec, liveness view and reconciler behind one handle
#[derive(Debug, Clone)]
pub struct Wallet {
    codec: Arc<WalletEventCodec>,
    reconciler: SpendingReconciler,
}

impl Wallet {
    pub fn new(signer: Arc<dyn NostrSigner>, transport: Arc<dyn RelayTransport>) -> Self {
        Self::from_codec(Arc::new(WalletEventCodec::new(signer, transport)))
    }

    pub fn from_codec(codec: Arc<WalletEventCodec>) -> Self {
        Self {
            reconciler: SpendingReconciler::new(codec.clone()),
            codec,
        }
    }

    pub fn codec(&self) -> &WalletEventCodec {
        &self.codec
    }

    /// Existing wallet config, or a fresh one with a new wallet key.
    pub async fn init(&self, mints: Vec<String>) -> Result<WalletConfig> {
        if let Some(existing) = self.codec.fetch_wallet_config().await? {
            return Ok(existing.record);
        }
        let config = WalletConfig {
            wallet_privkey: Keys::generate().secret_key_hex(),
            mints,
        };
        self.codec.publish_wallet_config(&config).await?;
        info!(mints = config.mints.len(), "wallet created");
        Ok(config)
    }

    pub async fn load(&self) -> Result<WalletState> {
        let token_sets = self.codec.fetch_token_sets().await?;
        let tombstones = self.codec.fetch_tombstones().await?;
        Ok(WalletState::from_events(token_sets, &tombstones))
    }

    pub async fn balance(&self) -> Result<u64> {
        self.load().await?.total_balance()
    }

    /// Spend `spent` from the live proofs at `mint`, keeping `change` returned by the mint.
    pub async fn spend(
        &self,
        mint: &str,
        spent: Vec<Proof>,
        change: Vec<Proof>,
    ) -> Result<ReconcileOutcome> {
        let state = self.load().await?;
        let held = state.proofs(mint);
        let held_secrets: HashSet<&str> = held.iter().map(|proof| proof.secret.as_str()).collect();
        if let Some(missing) = spent
            .iter()
            .find(|proof| !held_secrets.contains(proof.secret.as_str()))
        {
            return Err(GatewayError::InvalidProof(format!(
                "proof {} is not held at {mint}",
                missing.secret
            )));
        }

        let spent_secrets: HashSet<&str> = spent.iter().map(|proof| proof.secret.as_str()).collect();
        let unspent = held
            .iter()
            .filter(|proof| !spent_secrets.contains(proof.secret.as_str()))
            .cloned()
            .collect();

        self.reconciler
            .spend(SpendRequest {
                mint: mint.to_string(),
                spent,
                unspent,
                change,
                consumed_ids: state.live_ids(mint),
            })
            .await
    }

    pub async fn receive(
        &self,
        mint: &str,
        proofs: Vec<Proof>,
        redeemed: Vec<EventId>,
    ) -> Result<ReconcileOutcome> {
        self.reconciler
            .receive(ReceiveRequest {
                mint: mint.to_string(),
                proofs,
                redeemed,
            })
            .await
    }

    /// History entries, newest first
    pub async fn history(&self) -> Result<Vec<Stored<SpendingHistoryEntry>>> {
        let mut entries = self.codec.fetch_history().await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
