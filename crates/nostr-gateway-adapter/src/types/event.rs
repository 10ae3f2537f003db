/*
[INPUT]:  Event templates, keys and BIP-340 signatures
[OUTPUT]: Kind constants, UnsignedEvent / SignedEvent with canonical id and verification
[POS]:    Data layer - the signed envelope every other layer exchanges
[UPDATE]: When the canonical serialization or kind table changes
*/

use std::fmt;

use chrono::Utc;
use k256::schnorr::Signature;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use signature::hazmat::PrehashVerifier;

use super::identity::PublicKey;
use crate::http::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    pub const DELETION: Kind = Kind(5);
    pub const PAYMENT_QUOTE: Kind = Kind(7374);
    pub const TOKEN_SET: Kind = Kind(7375);
    pub const SPENDING_HISTORY: Kind = Kind(7376);
    pub const WALLET_CONFIG: Kind = Kind(17375);
    pub const NOSTR_CONNECT: Kind = Kind(24133);
    pub const HTTP_AUTH: Kind = Kind(27235);

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hex_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; $len]);

        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(value: &str) -> Result<Self> {
                let bytes = hex::decode(value).map_err(|e| {
                    GatewayError::InvalidResponse(format!("invalid {} hex: {e}", stringify!($name)))
                })?;
                let bytes: [u8; $len] = bytes.try_into().map_err(|_| {
                    GatewayError::InvalidResponse(format!(
                        "{} must be {} bytes",
                        stringify!($name),
                        $len
                    ))
                })?;
                Ok(Self(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl TryFrom<String> for $name {
            type Error = GatewayError;

            fn try_from(value: String) -> Result<Self> {
                Self::from_hex(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }
    };
}

hex_bytes!(EventId, 32);
hex_bytes!(EventSignature, 64);

/// Event template before a backend attaches pubkey, id and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub kind: Kind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub created_at: u64,
}

impl UnsignedEvent {
    pub fn new(kind: Kind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn tag<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn compute_id(&self, pubkey: &PublicKey) -> EventId {
        canonical_id(pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: EventSignature,
}

impl SignedEvent {
    pub fn from_parts(unsigned: UnsignedEvent, pubkey: PublicKey, id: EventId, sig: EventSignature) -> Self {
        Self {
            id,
            pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig,
        }
    }

    /// Recompute the id from the signed fields and check the BIP-340 signature over it.
    pub fn verify(&self) -> Result<()> {
        let expected = canonical_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if expected != self.id {
            return Err(GatewayError::VerificationFailed(format!(
                "event id {} does not match its content",
                self.id
            )));
        }
        let verifying_key = self.pubkey.verifying_key()?;
        let signature = Signature::try_from(self.sig.as_bytes().as_slice())
            .map_err(|_| GatewayError::VerificationFailed("malformed signature".into()))?;
        verifying_key
            .verify_prehash(self.id.as_bytes(), &signature)
            .map_err(|_| GatewayError::VerificationFailed(format!("bad signature on event {}", self.id)))
    }

    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            kind: self.kind,
            content: self.content.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
        }
    }

    /// First value of the first tag with this name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All tags with this name.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
    }
}

fn canonical_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: Kind,
    tags: &[Vec<String>],
    content: &str,
) -> EventId {
    let serialized = json!([0, pubkey.to_hex(), created_at, kind.0, tags, content]).to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    EventId(digest.into())
}
