/*
[INPUT]:  User-supplied secret key (hex or nsec)
[OUTPUT]: Locally computed signatures and NIP-44 payloads
[POS]:    Auth layer - manual private key backend
[UPDATE]: When local key handling changes
*/

use async_trait::async_trait;

use super::keys::Keys;
use super::signer::NostrSigner;
use crate::http::Result;
use crate::types::{PublicKey, SignedEvent, UnsignedEvent};

#[derive(Debug, Clone)]
pub struct LocalKeySigner {
    keys: Keys,
}

impl LocalKeySigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn parse(secret: &str) -> Result<Self> {
        Ok(Self::new(Keys::parse(secret)?))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

#[async_trait]
impl NostrSigner for LocalKeySigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        Ok(self.keys.public_key())
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent> {
        self.keys.sign_event(event)
    }

    async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.keys.encrypt(peer, plaintext)
    }

    async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.keys.decrypt(peer, ciphertext)
    }
}
