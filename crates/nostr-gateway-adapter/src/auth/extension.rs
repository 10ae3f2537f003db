/*
[INPUT]:  A locally available signing provider already bound to a keypair
[OUTPUT]: Serialized, verified provider calls behind the NostrSigner trait
[POS]:    Auth layer - extension-style backend and its provider abstraction
[UPDATE]: When the provider surface or guard policy changes
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::keys::Keys;
use super::signer::NostrSigner;
use crate::http::{GatewayError, Result};
use crate::types::{PublicKey, SignedEvent, UnsignedEvent};

/// Trait for extension signing operations
///
/// Implement this for whatever local signer the host exposes. Any call may
/// prompt the user, so every method is async and may fail with
/// `PermissionDenied`.
#[async_trait]
pub trait ExtensionProvider: Send + Sync {
    async fn get_public_key(&self) -> Result<PublicKey>;

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent>;

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String>;

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String>;
}

/// Extension backend. Provider calls never overlap.
pub struct ExtensionSigner {
    provider: Arc<dyn ExtensionProvider>,
    guard: Mutex<()>,
    public_key: RwLock<Option<PublicKey>>,
}

impl ExtensionSigner {
    pub fn new(provider: Arc<dyn ExtensionProvider>) -> Self {
        Self {
            provider,
            guard: Mutex::new(()),
            public_key: RwLock::new(None),
        }
    }

    fn cached_public_key(&self) -> Option<PublicKey> {
        match self.public_key.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn cache_public_key(&self, key: PublicKey) {
        match self.public_key.write() {
            Ok(mut guard) => *guard = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
    }

    /// Light validation used on session restore: asks the provider for its
    /// public key (never a signature) and compares it with `expected`.
    pub async fn validate(&self, expected: &PublicKey) -> Result<bool> {
        let _guard = self.guard.lock().await;
        let current = self.provider.get_public_key().await?;
        self.cache_public_key(current);
        debug!(expected = %expected, current = %current, "extension key validated");
        Ok(current == *expected)
    }
}

impl fmt::Debug for ExtensionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSigner")
            .field("public_key", &self.cached_public_key())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NostrSigner for ExtensionSigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        if let Some(key) = self.cached_public_key() {
            return Ok(key);
        }
        let _guard = self.guard.lock().await;
        // another caller may have filled the cache while we waited
        if let Some(key) = self.cached_public_key() {
            return Ok(key);
        }
        let key = self.provider.get_public_key().await?;
        self.cache_public_key(key);
        Ok(key)
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent> {
        let _guard = self.guard.lock().await;
        let signed = self.provider.sign_event(event).await?;
        signed.verify()?;
        if let Some(expected) = self.cached_public_key() {
            if signed.pubkey != expected {
                return Err(GatewayError::VerificationFailed(format!(
                    "extension signed with {} instead of {}",
                    signed.pubkey, expected
                )));
            }
        } else {
            self.cache_public_key(signed.pubkey);
        }
        Ok(signed)
    }

    async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        let _guard = self.guard.lock().await;
        self.provider.nip44_encrypt(peer, plaintext).await
    }

    async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        let _guard = self.guard.lock().await;
        self.provider.nip44_decrypt(peer, ciphertext).await
    }
}

/// Mock extension provider for testing
///
/// Backed by real keys, counts calls, and can be told to refuse.
pub struct MockExtensionProvider {
    keys: RwLock<Keys>,
    delay: Duration,
    deny_signing: AtomicBool,
    deny_crypto: AtomicBool,
    public_key_calls: AtomicUsize,
    sign_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExtensionProvider {
    pub fn new(keys: Keys) -> Self {
        Self {
            keys: RwLock::new(keys),
            delay: Duration::ZERO,
            deny_signing: AtomicBool::new(false),
            deny_crypto: AtomicBool::new(false),
            public_key_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long, which makes overlapping calls observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_deny_signing(&self, deny: bool) {
        self.deny_signing.store(deny, Ordering::SeqCst);
    }

    pub fn set_deny_crypto(&self, deny: bool) {
        self.deny_crypto.store(deny, Ordering::SeqCst);
    }

    /// Simulates the user switching accounts inside the extension.
    pub fn replace_keys(&self, keys: Keys) {
        match self.keys.write() {
            Ok(mut guard) => *guard = keys,
            Err(poisoned) => *poisoned.into_inner() = keys,
        }
    }

    pub fn public_key_calls(&self) -> usize {
        self.public_key_calls.load(Ordering::SeqCst)
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    /// Highest number of provider calls that were running at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn keys(&self) -> Keys {
        match self.keys.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MockExtensionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockExtensionProvider")
            .field("public_key_calls", &self.public_key_calls())
            .field("sign_calls", &self.sign_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExtensionProvider for MockExtensionProvider {
    async fn get_public_key(&self) -> Result<PublicKey> {
        self.public_key_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        Ok(self.keys().public_key())
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        if self.deny_signing.load(Ordering::SeqCst) {
            return Err(GatewayError::denied("sign_event", "user rejected the request"));
        }
        self.keys().sign_event(event)
    }

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.enter().await;
        if self.deny_crypto.load(Ordering::SeqCst) {
            return Err(GatewayError::denied("nip44_encrypt", "user rejected the request"));
        }
        self.keys().encrypt(peer, plaintext)
    }

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.enter().await;
        if self.deny_crypto.load(Ordering::SeqCst) {
            return Err(GatewayError::denied("nip44_decrypt", "user rejected the request"));
        }
        self.keys().decrypt(peer, ciphertext)
    }
}
