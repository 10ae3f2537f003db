/*
[INPUT]:  Spent, unspent, change and received proofs with the token sets they replace
[OUTPUT]: Published token set, deletion request and history entry, plus non-fatal warnings
[POS]:    Wallet layer - spend/receive bookkeeping over the event ledger
[UPDATE]: When the publish sequence or its failure policy changes
*/

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::codec::WalletEventCodec;
use crate::http::{GatewayError, Result};
use crate::types::{
    DeleteTombstone, Direction, EventId, Proof, SpendingHistoryEntry, TokenSet, total_amount,
};

/// Value leaving the wallet at one mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRequest {
    pub mint: String,
    pub spent: Vec<Proof>,
    pub unspent: Vec<Proof>,
    pub change: Vec<Proof>,
    /// Token set events the new set replaces
    pub consumed_ids: Vec<EventId>,
}

/// Value arriving at one mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub mint: String,
    pub proofs: Vec<Proof>,
    /// Payment events this receipt redeems, kept public on the history entry
    pub redeemed: Vec<EventId>,
}

/// A follow-up publish that failed after the token set was already durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileWarning {
    TombstoneNotPublished { reason: String },
    HistoryNotPublished { reason: String },
}

impl fmt::Display for ReconcileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileWarning::TombstoneNotPublished { reason } => {
                write!(f, "deletion request not published: {reason}")
            }
            ReconcileWarning::HistoryNotPublished { reason } => {
                write!(f, "history entry not published: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub token_set_id: EventId,
    pub tombstone_id: Option<EventId>,
    pub history_id: Option<EventId>,
    pub amount: u64,
    pub warnings: Vec<ReconcileWarning>,
}

impl ReconcileOutcome {
    /// Every publish in the sequence landed.
    pub fn is_durable(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Sequences the publishes for a spend or receive. Nothing is rolled back.
#[derive(Debug, Clone)]
pub struct SpendingReconciler {
    codec: Arc<WalletEventCodec>,
}

impl SpendingReconciler {
    pub fn new(codec: Arc<WalletEventCodec>) -> Self {
        Self { codec }
    }

    pub async fn spend(&self, request: SpendRequest) -> Result<ReconcileOutcome> {
        // validate everything before the first publish
        let spent_amount = total_amount(&request.spent)?;
        if spent_amount == 0 {
            return Err(GatewayError::InvalidProof("spend without spent proofs".into()));
        }
        let mut kept = request.unspent;
        kept.extend(request.change);
        total_amount(&kept)?;

        let token_set = TokenSet::new(request.mint.clone(), kept, request.consumed_ids.clone());
        let published = self.codec.publish_token_set(&token_set).await.map_err(|err| {
            warn!(mint = %request.mint, error = %err, "token set publish failed, spend aborted");
            err
        })?;
        let mut warnings = Vec::new();

        let tombstone_id = if request.consumed_ids.is_empty() {
            None
        } else {
            let tombstone = DeleteTombstone::token_sets(request.consumed_ids.clone());
            match self.codec.publish_tombstone(&tombstone).await {
                Ok(event) => Some(event.id),
                Err(err) => {
                    warn!(mint = %request.mint, error = %err, "deletion request publish failed");
                    warnings.push(ReconcileWarning::TombstoneNotPublished {
                        reason: err.to_string(),
                    });
                    None
                }
            }
        };

        let entry = SpendingHistoryEntry {
            direction: Direction::Out,
            amount: spent_amount,
            created: vec![published.id],
            destroyed: request.consumed_ids,
            redeemed: Vec::new(),
        };
        let history_id = self.publish_history(&entry, &mut warnings).await;

        info!(
            mint = %request.mint,
            amount = spent_amount,
            token_set = %published.id,
            warnings = warnings.len(),
            "spend reconciled"
        );
        Ok(ReconcileOutcome {
            token_set_id: published.id,
            tombstone_id,
            history_id,
            amount: spent_amount,
            warnings,
        })
    }

    pub async fn receive(&self, request: ReceiveRequest) -> Result<ReconcileOutcome> {
        let amount = total_amount(&request.proofs)?;
        if amount == 0 {
            return Err(GatewayError::InvalidProof("receive without proofs".into()));
        }

        let token_set = TokenSet::new(request.mint.clone(), request.proofs, Vec::new());
        let published = self.codec.publish_token_set(&token_set).await.map_err(|err| {
            warn!(mint = %request.mint, error = %err, "token set publish failed, receive aborted");
            err
        })?;

        let mut warnings = Vec::new();
        let entry = SpendingHistoryEntry {
            direction: Direction::In,
            amount,
            created: vec![published.id],
            destroyed: Vec::new(),
            redeemed: request.redeemed,
        };
        let history_id = self.publish_history(&entry, &mut warnings).await;

        info!(mint = %request.mint, amount, token_set = %published.id, "receive reconciled");
        Ok(ReconcileOutcome {
            token_set_id: published.id,
            tombstone_id: None,
            history_id,
            amount,
            warnings,
        })
    }

    async fn publish_history(
        &self,
        entry: &SpendingHistoryEntry,
        warnings: &mut Vec<ReconcileWarning>,
    ) -> Option<EventId> {
        match self.codec.publish_history(entry).await {
            Ok(event) => Some(event.id),
            Err(err) => {
                warn!(direction = %entry.direction, amount = entry.amount, error = %err, "history publish failed");
                warnings.push(ReconcileWarning::HistoryNotPublished {
                    reason: err.to_string(),
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Keys, LocalKeySigner};
    use crate::relay::MemoryRelay;
    use crate::types::Kind;

    const MINT: &str = "https://mint.example";

    fn reconciler() -> (SpendingReconciler, Arc<MemoryRelay>) {
        let relay = Arc::new(MemoryRelay::new());
        let codec = WalletEventCodec::new(
            Arc::new(LocalKeySigner::new(Keys::generate())),
            relay.clone(),
        );
        (SpendingReconciler::new(Arc::new(codec)), relay)
    }

    fn proof(amount: u64, secret: &str) -> Proof {
        Proof::new("009a1f293253e41e", amount, secret, "02c0ffee")
    }

    #[tokio::test]
    async fn test_invalid_spend_publishes_nothing() {
        let (reconciler, relay) = reconciler();
        let err = reconciler
            .spend(SpendRequest {
                mint: MINT.into(),
                spent: Vec::new(),
                unspent: vec![proof(5, "a")],
                change: Vec::new(),
                consumed_ids: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidProof(_)));

        let err = reconciler
            .spend(SpendRequest {
                mint: MINT.into(),
                spent: vec![proof(u64::MAX, "a"), proof(1, "b")],
                unspent: Vec::new(),
                change: Vec::new(),
                consumed_ids: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidProof(_)));
        assert!(relay.events().is_empty());
    }

    #[tokio::test]
    async fn test_spend_without_consumed_sets_skips_tombstone() {
        let (reconciler, relay) = reconciler();
        let outcome = reconciler
            .spend(SpendRequest {
                mint: MINT.into(),
                spent: vec![proof(4, "a")],
                unspent: vec![proof(2, "b")],
                change: Vec::new(),
                consumed_ids: Vec::new(),
            })
            .await
            .unwrap();
        assert!(outcome.is_durable());
        assert!(outcome.tombstone_id.is_none());
        assert_eq!(outcome.amount, 4);
        assert!(relay.events_of_kind(Kind::DELETION).is_empty());
        assert_eq!(relay.events_of_kind(Kind::SPENDING_HISTORY).len(), 1);
    }

    #[tokio::test]
    async fn test_history_failure_is_a_warning() {
        let (reconciler, relay) = reconciler();
        relay.fail_publish(Kind::SPENDING_HISTORY);
        let outcome = reconciler
            .receive(ReceiveRequest {
                mint: MINT.into(),
                proofs: vec![proof(21, "a")],
                redeemed: Vec::new(),
            })
            .await
            .unwrap();
        assert!(!outcome.is_durable());
        assert!(outcome.history_id.is_none());
        assert!(matches!(
            outcome.warnings[0],
            ReconcileWarning::HistoryNotPublished { .. }
        ));
        assert_eq!(relay.events_of_kind(Kind::TOKEN_SET).len(), 1);
    }

    #[tokio::test]
    async fn test_token_set_failure_aborts() {
        let (reconciler, relay) = reconciler();
        relay.fail_publish(Kind::TOKEN_SET);
        let result = reconciler
            .spend(SpendRequest {
                mint: MINT.into(),
                spent: vec![proof(4, "a")],
                unspent: Vec::new(),
                change: Vec::new(),
                consumed_ids: vec![EventId::from_bytes([9; 32])],
            })
            .await;
        assert!(matches!(result, Err(GatewayError::NetworkOrRelay(_))));
        assert!(relay.events().is_empty());
    }
}
