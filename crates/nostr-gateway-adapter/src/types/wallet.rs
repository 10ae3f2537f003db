/*
[INPUT]:  E-cash proofs and wallet event payloads
[OUTPUT]: Proof, TokenSet, SpendingHistoryEntry, DeleteTombstone, WalletConfig, PaymentQuote
[POS]:    Data layer - wallet records and their tag encodings
[UPDATE]: When a wallet event layout changes
*/

use serde::{Deserialize, Serialize};

use super::enums::{Direction, TokenMarker};
use super::event::{EventId, Kind, SignedEvent};
use crate::http::{GatewayError, Result};

/// Opaque value-bearing record issued by a mint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    pub id: String,
    pub amount: u64,
    pub secret: String,
    #[serde(rename = "C")]
    pub c: String,
}

impl Proof {
    pub fn new(id: impl Into<String>, amount: u64, secret: impl Into<String>, c: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            amount,
            secret: secret.into(),
            c: c.into(),
        }
    }
}

/// Checked sum of proof amounts. Zero-valued proofs and overflow are rejected.
pub fn total_amount(proofs: &[Proof]) -> Result<u64> {
    proofs.iter().try_fold(0u64, |acc, proof| {
        if proof.amount == 0 {
            return Err(GatewayError::InvalidProof(format!(
                "proof {} has zero amount",
                proof.secret
            )));
        }
        acc.checked_add(proof.amount)
            .ok_or_else(|| GatewayError::InvalidProof("proof amounts overflow".into()))
    })
}

/// Unspent proofs at one mint, published as one encrypted kind-7375 event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub mint: String,
    pub proofs: Vec<Proof>,
    #[serde(rename = "del", default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<EventId>,
}

impl TokenSet {
    pub fn new(mint: impl Into<String>, proofs: Vec<Proof>, supersedes: Vec<EventId>) -> Self {
        Self {
            mint: mint.into(),
            proofs,
            supersedes,
        }
    }

    pub fn amount(&self) -> Result<u64> {
        total_amount(&self.proofs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingHistoryEntry {
    pub direction: Direction,
    pub amount: u64,
    #[serde(default)]
    pub created: Vec<EventId>,
    #[serde(default)]
    pub destroyed: Vec<EventId>,
    #[serde(default)]
    pub redeemed: Vec<EventId>,
}

impl SpendingHistoryEntry {
    /// Tags that travel inside the encrypted content.
    pub fn encrypted_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![
            vec!["direction".to_string(), self.direction.to_string()],
            vec!["amount".to_string(), self.amount.to_string()],
        ];
        tags.extend(marker_tags(&self.created, TokenMarker::Created));
        tags.extend(marker_tags(&self.destroyed, TokenMarker::Destroyed));
        tags
    }

    /// Redeemed references stay readable on the event itself.
    pub fn public_tags(&self) -> Vec<Vec<String>> {
        marker_tags(&self.redeemed, TokenMarker::Redeemed)
    }

    pub fn from_tags(encrypted: &[Vec<String>], public: &[Vec<String>]) -> Result<Self> {
        let mut direction = None;
        let mut amount = None;
        let mut created = Vec::new();
        let mut destroyed = Vec::new();
        let mut redeemed = Vec::new();

        for tag in encrypted.iter().chain(public.iter()) {
            match tag.first().map(String::as_str) {
                Some("direction") => {
                    direction = tag.get(1).map(|v| v.parse::<Direction>()).transpose()?;
                }
                Some("amount") => {
                    amount = tag
                        .get(1)
                        .map(|v| {
                            v.parse::<u64>().map_err(|_| {
                                GatewayError::InvalidResponse(format!("bad history amount: {v}"))
                            })
                        })
                        .transpose()?;
                }
                Some("e") => {
                    let (Some(id), Some(marker)) = (tag.get(1), tag.get(3)) else {
                        continue;
                    };
                    let id = EventId::from_hex(id)?;
                    match TokenMarker::parse(marker) {
                        Some(TokenMarker::Created) => created.push(id),
                        Some(TokenMarker::Destroyed) => destroyed.push(id),
                        Some(TokenMarker::Redeemed) => redeemed.push(id),
                        None => {}
                    }
                }
                _ => {}
            }
        }

        let direction = direction
            .ok_or_else(|| GatewayError::InvalidResponse("history entry without direction".into()))?;
        let amount = amount
            .filter(|amount| *amount > 0)
            .ok_or_else(|| GatewayError::InvalidResponse("history entry without positive amount".into()))?;

        Ok(Self {
            direction,
            amount,
            created,
            destroyed,
            redeemed,
        })
    }
}

fn marker_tags(ids: &[EventId], marker: TokenMarker) -> Vec<Vec<String>> {
    ids.iter()
        .map(|id| {
            vec![
                "e".to_string(),
                id.to_hex(),
                String::new(),
                marker.as_str().to_string(),
            ]
        })
        .collect()
}

/// Advisory deletion request for superseded events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTombstone {
    pub target_kind: Kind,
    pub target_ids: Vec<EventId>,
}

impl DeleteTombstone {
    pub fn token_sets(target_ids: Vec<EventId>) -> Self {
        Self {
            target_kind: Kind::TOKEN_SET,
            target_ids,
        }
    }

    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags: Vec<Vec<String>> = self
            .target_ids
            .iter()
            .map(|id| vec!["e".to_string(), id.to_hex()])
            .collect();
        tags.push(vec!["k".to_string(), self.target_kind.to_string()]);
        tags
    }

    pub fn from_event(event: &SignedEvent) -> Result<Self> {
        if event.kind != Kind::DELETION {
            return Err(GatewayError::InvalidResponse(format!(
                "kind {} is not a deletion",
                event.kind
            )));
        }
        let target_kind = event
            .tag_value("k")
            .and_then(|k| k.parse::<u16>().ok())
            .map(Kind)
            .ok_or_else(|| GatewayError::InvalidResponse("deletion without k tag".into()))?;
        let target_ids = event
            .tags_named("e")
            .filter_map(|tag| tag.get(1))
            .map(|id| EventId::from_hex(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            target_kind,
            target_ids,
        })
    }
}

/// Replaceable wallet metadata: the wallet's own key and the mints it uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    pub wallet_privkey: String,
    pub mints: Vec<String>,
}

impl WalletConfig {
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![vec!["privkey".to_string(), self.wallet_privkey.clone()]];
        tags.extend(self.mints.iter().map(|mint| vec!["mint".to_string(), mint.clone()]));
        tags
    }

    pub fn from_tags(tags: &[Vec<String>]) -> Result<Self> {
        let mut wallet_privkey = None;
        let mut mints = Vec::new();
        for tag in tags {
            match (tag.first().map(String::as_str), tag.get(1)) {
                (Some("privkey"), Some(value)) => wallet_privkey = Some(value.clone()),
                (Some("mint"), Some(value)) => mints.push(value.clone()),
                _ => {}
            }
        }
        let wallet_privkey = wallet_privkey
            .ok_or_else(|| GatewayError::InvalidResponse("wallet config without privkey".into()))?;
        Ok(Self {
            wallet_privkey,
            mints,
        })
    }
}

/// Pending mint quote. Readers drop it once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentQuote {
    pub quote_id: String,
    pub mint: String,
    pub expires_at: u64,
}

impl PaymentQuote {
    pub fn public_tags(&self) -> Vec<Vec<String>> {
        vec![
            vec!["mint".to_string(), self.mint.clone()],
            vec!["expiration".to_string(), self.expires_at.to_string()],
        ]
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// A decoded wallet record together with the event that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored<T> {
    pub event_id: EventId,
    pub created_at: u64,
    pub record: T,
}
