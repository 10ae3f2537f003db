/*
[INPUT]:  Secret key bytes (hex or nsec) or OS randomness
[OUTPUT]: secp256k1 keypair with BIP-340 event signing and NIP-44 helpers
[POS]:    Auth layer - local key material
[UPDATE]: When changing key formats or the signing primitive
*/

use std::fmt;

use bech32::{Bech32, Hrp};
use k256::schnorr::SigningKey;
use rand::rngs::OsRng;
use signature::hazmat::PrehashSigner;

use super::nip44::{self, ConversationKey};
use crate::http::{GatewayError, Result};
use crate::types::{EventId, EventSignature, PublicKey, SignedEvent, UnsignedEvent};

const NSEC: Hrp = Hrp::parse_unchecked("nsec");

/// secp256k1 keypair for Schnorr event signing
#[derive(Clone)]
pub struct Keys {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Keys {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Create keys from existing secret key bytes (32 bytes)
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(bytes)
            .map_err(|_| GatewayError::Crypto("secret key is not a valid scalar".into()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Parse a secret key given as 64 hex characters or `nsec1...`
    pub fn parse(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.starts_with("nsec1") {
            let (hrp, bytes) = bech32::decode(secret)
                .map_err(|e| GatewayError::Crypto(format!("invalid nsec: {e}")))?;
            if hrp != NSEC {
                return Err(GatewayError::Crypto(format!(
                    "expected nsec prefix, got {}",
                    hrp.as_str()
                )));
            }
            return Self::from_secret_bytes(&bytes);
        }
        let bytes = hex::decode(secret)
            .map_err(|e| GatewayError::Crypto(format!("invalid secret key hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(GatewayError::Crypto(format!(
                "secret key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Self::from_secret_bytes(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from_bytes(signing_key.verifying_key().to_bytes().into());
        Self {
            signing_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Get the raw secret key bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key_bytes())
    }

    pub fn to_nsec(&self) -> Result<String> {
        bech32::encode::<Bech32>(NSEC, &self.secret_key_bytes())
            .map_err(|e| GatewayError::Crypto(format!("nsec encoding failed: {e}")))
    }

    /// Sign the 32-byte event id
    pub fn sign_id(&self, id: &EventId) -> Result<EventSignature> {
        let signature = self
            .signing_key
            .sign_prehash(id.as_bytes())
            .map_err(|e| GatewayError::Crypto(format!("schnorr signing failed: {e}")))?;
        Ok(EventSignature::from_bytes(signature.to_bytes()))
    }

    pub fn sign_event(&self, unsigned: UnsignedEvent) -> Result<SignedEvent> {
        let id = unsigned.compute_id(&self.public_key);
        let sig = self.sign_id(&id)?;
        Ok(SignedEvent::from_parts(unsigned, self.public_key, id, sig))
    }

    pub fn conversation_key(&self, peer: &PublicKey) -> Result<ConversationKey> {
        ConversationKey::derive(self.signing_key.as_nonzero_scalar(), peer)
    }

    /// NIP-44 v2 encrypt to `peer`
    pub fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        nip44::encrypt(&self.conversation_key(peer)?, plaintext)
    }

    /// NIP-44 v2 decrypt a payload from `peer`
    pub fn decrypt(&self, peer: &PublicKey, payload: &str) -> Result<String> {
        nip44::decrypt(&self.conversation_key(peer)?, payload)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
