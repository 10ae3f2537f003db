/*
[INPUT]:  x-only secp256k1 public keys in hex or npub form
[OUTPUT]: PublicKey newtype and the Identity record
[POS]:    Data layer - who the user is
[UPDATE]: When identity fields or key encodings change
*/

use std::fmt;
use std::str::FromStr;

use bech32::{Bech32, Hrp};
use k256::schnorr::VerifyingKey;
use serde::{Deserialize, Serialize};

use super::enums::SigningMethod;
use crate::http::{GatewayError, Result};

const NPUB: Hrp = Hrp::parse_unchecked("npub");

/// 32-byte x-only public key, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GatewayError::Crypto(format!("public key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| GatewayError::Crypto(format!("invalid public key hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn from_npub(value: &str) -> Result<Self> {
        let (hrp, bytes) = bech32::decode(value)
            .map_err(|e| GatewayError::Crypto(format!("invalid npub: {e}")))?;
        if hrp != NPUB {
            return Err(GatewayError::Crypto(format!(
                "expected npub prefix, got {}",
                hrp.as_str()
            )));
        }
        Self::from_slice(&bytes)
    }

    /// Accepts either 64 hex characters or an `npub1...` string.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let key = if value.starts_with("npub1") {
            Self::from_npub(value)?
        } else {
            Self::from_hex(value)?
        };
        key.verifying_key()?;
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_npub(&self) -> String {
        bech32::encode::<Bech32>(NPUB, &self.0).unwrap_or_else(|_| self.to_hex())
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|_| GatewayError::VerificationFailed("public key is not a curve point".into()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(value: PublicKey) -> Self {
        value.to_hex()
    }
}

/// The authenticated user. Replaced wholesale on every login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub public_key: PublicKey,
    pub display_id: String,
    pub signing_method: SigningMethod,
}

impl Identity {
    pub fn new(public_key: PublicKey, signing_method: SigningMethod) -> Self {
        Self {
            public_key,
            display_id: public_key.to_npub(),
            signing_method,
        }
    }

    pub fn can_sign(&self) -> bool {
        self.signing_method.can_sign()
    }
}
