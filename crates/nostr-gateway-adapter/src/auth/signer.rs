/*
[INPUT]:  Unsigned events, peer keys and payloads from higher layers
[OUTPUT]: Signed events and NIP-44 payloads from whichever backend is active
[POS]:    Auth layer - signing capability abstraction and backend dispatch
[UPDATE]: When adding a backend variant or a capability
*/

use async_trait::async_trait;

use super::extension::ExtensionSigner;
use super::local::LocalKeySigner;
use super::read_only::ReadOnlySigner;
use super::remote::RemoteSigner;
use super::session::SessionCredential;
use crate::http::Result;
use crate::types::{PublicKey, SignedEvent, SigningMethod, UnsignedEvent};

/// Signing and encryption capability.
///
/// The trait is async because extension providers and remote signers answer
/// out of process and may prompt the user.
#[async_trait]
pub trait NostrSigner: Send + Sync {
    async fn get_public_key(&self) -> Result<PublicKey>;

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent>;

    /// NIP-44 v2 encrypt `plaintext` for `peer`
    async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String>;

    /// NIP-44 v2 decrypt a payload sent by `peer`
    async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String>;
}

/// The active backend. Exactly one is installed per session.
#[derive(Debug)]
pub enum SignerBackend {
    Extension(ExtensionSigner),
    RemoteSigner(RemoteSigner),
    LocalKey(LocalKeySigner),
    ReadOnly(ReadOnlySigner),
}

impl SignerBackend {
    pub fn method(&self) -> SigningMethod {
        match self {
            SignerBackend::Extension(_) => SigningMethod::Extension,
            SignerBackend::RemoteSigner(_) => SigningMethod::RemoteSigner,
            SignerBackend::LocalKey(_) => SigningMethod::LocalKey,
            SignerBackend::ReadOnly(_) => SigningMethod::ReadOnly,
        }
    }

    /// Material needed to rebuild this backend when the session is restored.
    pub fn credential(&self) -> Option<SessionCredential> {
        match self {
            SignerBackend::Extension(_) | SignerBackend::ReadOnly(_) => None,
            SignerBackend::LocalKey(signer) => Some(SessionCredential::LocalKey {
                secret_key: signer.keys().secret_key_hex(),
            }),
            SignerBackend::RemoteSigner(signer) => {
                Some(SessionCredential::RemoteSigner(signer.binding()))
            }
        }
    }

    /// Release backend resources on logout.
    pub async fn close(&self) {
        if let SignerBackend::RemoteSigner(signer) = self {
            signer.close().await;
        }
    }

    fn as_signer(&self) -> &dyn NostrSigner {
        match self {
            SignerBackend::Extension(signer) => signer,
            SignerBackend::RemoteSigner(signer) => signer,
            SignerBackend::LocalKey(signer) => signer,
            SignerBackend::ReadOnly(signer) => signer,
        }
    }
}

#[async_trait]
impl NostrSigner for SignerBackend {
    async fn get_public_key(&self) -> Result<PublicKey> {
        self.as_signer().get_public_key().await
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent> {
        self.as_signer().sign_event(event).await
    }

    async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.as_signer().encrypt(peer, plaintext).await
    }

    async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.as_signer().decrypt(peer, ciphertext).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Keys;
    use crate::http::GatewayError;
    use crate::types::Kind;

    #[tokio::test]
    async fn test_local_backend_dispatch() {
        let keys = Keys::generate();
        let backend = SignerBackend::LocalKey(LocalKeySigner::new(keys.clone()));
        assert_eq!(backend.method(), SigningMethod::LocalKey);
        assert_eq!(backend.get_public_key().await.unwrap(), keys.public_key());

        let event = backend
            .sign_event(UnsignedEvent::new(Kind::HTTP_AUTH, "application/json"))
            .await
            .unwrap();
        assert!(event.verify().is_ok());

        match backend.credential() {
            Some(SessionCredential::LocalKey { secret_key }) => {
                assert_eq!(secret_key, keys.secret_key_hex())
            }
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_only_backend_dispatch() {
        let keys = Keys::generate();
        let backend = SignerBackend::ReadOnly(ReadOnlySigner::new(keys.public_key()));
        assert_eq!(backend.method(), SigningMethod::ReadOnly);
        assert!(backend.credential().is_none());
        let err = backend
            .sign_event(UnsignedEvent::new(Kind::HTTP_AUTH, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CapabilityUnavailable { .. }));
    }
}
