/*
[INPUT]:  Public key (hex or npub)
[OUTPUT]: Identity without signing or encryption capability
[POS]:    Auth layer - read-only backend
[UPDATE]: Rarely
*/

use async_trait::async_trait;

use super::signer::NostrSigner;
use crate::http::{GatewayError, Result};
use crate::types::{PublicKey, SignedEvent, UnsignedEvent};

#[derive(Debug, Clone)]
pub struct ReadOnlySigner {
    public_key: PublicKey,
}

impl ReadOnlySigner {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    pub fn parse(public_key: &str) -> Result<Self> {
        Ok(Self::new(PublicKey::parse(public_key)?))
    }
}

#[async_trait]
impl NostrSigner for ReadOnlySigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        Ok(self.public_key)
    }

    async fn sign_event(&self, _event: UnsignedEvent) -> Result<SignedEvent> {
        Err(GatewayError::capability("sign_event on a read-only identity"))
    }

    async fn encrypt(&self, _peer: &PublicKey, _plaintext: &str) -> Result<String> {
        Err(GatewayError::capability("encrypt on a read-only identity"))
    }

    async fn decrypt(&self, _peer: &PublicKey, _ciphertext: &str) -> Result<String> {
        Err(GatewayError::capability("decrypt on a read-only identity"))
    }
}
