/*
[INPUT]:  Login parameters, a session store, optional extension provider and relay transport
[OUTPUT]: The active signer backend, the current Identity and identity change notifications
[POS]:    Auth layer - orchestrates the identity lifecycle
[UPDATE]: When login methods, restore rules or state transitions change
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use super::extension::{ExtensionProvider, ExtensionSigner};
use super::handshake::{HandshakeTriggers, RemoteSignerHandshake};
use super::keys::Keys;
use super::local::LocalKeySigner;
use super::observer::{IdentityChange, ObserverRegistry, Subscription};
use super::read_only::ReadOnlySigner;
use super::remote::{DEFAULT_REQUEST_TIMEOUT, RemoteSigner};
use super::session::{Session, SessionCredential, SessionRecord, SessionStore, default_session_ttl};
use super::signer::{NostrSigner, SignerBackend};
use super::uri::BunkerUri;
use crate::http::{GatewayError, Result};
use crate::relay::RelayTransport;
use crate::types::{Identity, SigningMethod};

/// Lifecycle state of the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Revoked,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::Expired => "expired",
            AuthState::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session_ttl: TimeDelta,
    /// Per-RPC timeout for remote signers bound by this manager
    pub remote_request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_ttl: default_session_ttl(),
            remote_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// How to log in.
pub enum LoginParams {
    Extension,
    LocalKey { secret: String },
    ReadOnly { public_key: String },
    RemoteSigner {
        handshake: RemoteSignerHandshake,
        triggers: HandshakeTriggers,
    },
    Bunker { uri: String },
}

impl LoginParams {
    pub fn method(&self) -> SigningMethod {
        match self {
            LoginParams::Extension => SigningMethod::Extension,
            LoginParams::LocalKey { .. } => SigningMethod::LocalKey,
            LoginParams::ReadOnly { .. } => SigningMethod::ReadOnly,
            LoginParams::RemoteSigner { .. } | LoginParams::Bunker { .. } => {
                SigningMethod::RemoteSigner
            }
        }
    }
}

impl fmt::Debug for LoginParams {
    // keep secrets out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginParams")
            .field("method", &self.method())
            .finish_non_exhaustive()
    }
}

struct Active {
    session: Session,
    backend: Arc<SignerBackend>,
}

struct Inner {
    state: AuthState,
    active: Option<Active>,
    generation: u64,
}

/// Owns the single logical session and the backend behind it.
pub struct IdentityManager {
    store: Arc<dyn SessionStore>,
    extension: Option<Arc<dyn ExtensionProvider>>,
    transport: Option<Arc<dyn RelayTransport>>,
    config: ManagerConfig,
    inner: Mutex<Inner>,
    transition: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    observers: ObserverRegistry,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            extension: None,
            transport: None,
            config: ManagerConfig::default(),
            inner: Mutex::new(Inner {
                state: AuthState::Unauthenticated,
                active: None,
                generation: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn with_extension(mut self, provider: Arc<dyn ExtensionProvider>) -> Self {
        self.extension = Some(provider);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    /// Bumped on every identity change.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.session.identity.clone())
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().active.as_ref().map(|active| active.session.clone())
    }

    pub fn on_identity_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&IdentityChange) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// First call restores the persisted session; later calls return the current identity.
    pub async fn initialize(&self) -> Result<Option<Identity>> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(self.current_identity());
        }
        match self.restore_session().await {
            Ok(identity) => Ok(identity),
            Err(err) => {
                self.initialized.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Drop the in-memory session and observers. The persisted record is kept.
    pub async fn teardown(&self) {
        let _transition = self.transition.lock().await;
        let previous = {
            let mut inner = self.lock();
            inner.state = AuthState::Unauthenticated;
            inner.generation += 1;
            inner.active.take()
        };
        if let Some(active) = previous {
            active.backend.close().await;
        }
        self.observers.clear();
        self.initialized.store(false, Ordering::SeqCst);
        debug!("identity manager torn down");
    }

    /// Rebuild the backend from the persisted record without asking for a signature.
    pub async fn restore_session(&self) -> Result<Option<Identity>> {
        let _transition = self.transition.lock().await;

        let Some(record) = self.store.load()? else {
            return Ok(self.current_identity());
        };
        let session = Session::from_record(&record, self.config.session_ttl);
        if session.is_expired() {
            info!(
                identity = %session.identity.display_id,
                established_at = %session.established_at,
                "discarding expired session"
            );
            self.store.clear()?;
            return Ok(None);
        }

        if let Some(current) = self.current_identity() {
            if current == session.identity {
                return Ok(Some(current));
            }
        }

        let Some(backend) = self.rebuild_backend(&record).await? else {
            warn!(
                identity = %record.display_id,
                method = %record.signing_method,
                "stored session does not match its backend, discarding"
            );
            self.store.clear()?;
            return Ok(None);
        };

        let identity = session.identity.clone();
        self.install(session, Arc::new(backend)).await;
        info!(identity = %identity.display_id, method = %identity.signing_method, "session restored");
        Ok(Some(identity))
    }

    // Ok(None) means the stored record cannot be trusted.
    async fn rebuild_backend(&self, record: &SessionRecord) -> Result<Option<SignerBackend>> {
        let expected = record.public_key;
        match (record.signing_method, &record.credential) {
            (SigningMethod::Extension, _) => {
                let provider = self.extension_provider()?;
                let signer = ExtensionSigner::new(provider);
                if !signer.validate(&expected).await? {
                    return Ok(None);
                }
                Ok(Some(SignerBackend::Extension(signer)))
            }
            (SigningMethod::LocalKey, Some(SessionCredential::LocalKey { secret_key })) => {
                let signer = match LocalKeySigner::parse(secret_key) {
                    Ok(signer) => signer,
                    Err(err) => {
                        warn!(error = %err, "stored local key is unreadable");
                        return Ok(None);
                    }
                };
                if signer.keys().public_key() != expected {
                    return Ok(None);
                }
                Ok(Some(SignerBackend::LocalKey(signer)))
            }
            (SigningMethod::ReadOnly, _) => {
                Ok(Some(SignerBackend::ReadOnly(ReadOnlySigner::new(expected))))
            }
            (SigningMethod::RemoteSigner, Some(SessionCredential::RemoteSigner(binding))) => {
                if binding.user_pubkey.is_some_and(|user| user != expected) {
                    return Ok(None);
                }
                let transport = self.relay_transport()?;
                let signer = RemoteSigner::from_binding(
                    transport,
                    binding,
                    self.config.remote_request_timeout,
                )
                .await?;
                Ok(Some(SignerBackend::RemoteSigner(signer)))
            }
            _ => Ok(None),
        }
    }

    fn extension_provider(&self) -> Result<Arc<dyn ExtensionProvider>> {
        self.extension
            .clone()
            .ok_or_else(|| GatewayError::capability("no extension provider available"))
    }

    fn relay_transport(&self) -> Result<Arc<dyn RelayTransport>> {
        self.transport
            .clone()
            .ok_or_else(|| GatewayError::capability("no relay transport configured"))
    }

    pub async fn login(&self, params: LoginParams) -> Result<Identity> {
        let method = params.method();
        let previous_state = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = AuthState::Authenticating;
            previous
        };
        debug!(method = %method, "login started");

        let backend = match self.build_backend(params).await {
            Ok(backend) => backend,
            Err(err) => {
                self.revert_state(previous_state);
                warn!(method = %method, error = %err, "login failed");
                return Err(err);
            }
        };
        let public_key = match backend.get_public_key().await {
            Ok(key) => key,
            Err(err) => {
                backend.close().await;
                self.revert_state(previous_state);
                return Err(err);
            }
        };

        let _transition = self.transition.lock().await;
        let session = Session::new(Identity::new(public_key, method), self.config.session_ttl);
        let record = session.to_record(backend.credential());
        if let Err(err) = self.store.save(&record) {
            backend.close().await;
            self.revert_state(previous_state);
            return Err(err);
        }

        let identity = session.identity.clone();
        self.install(session, Arc::new(backend)).await;
        info!(identity = %identity.display_id, method = %method, "logged in");
        Ok(identity)
    }

    async fn build_backend(&self, params: LoginParams) -> Result<SignerBackend> {
        match params {
            LoginParams::Extension => Ok(SignerBackend::Extension(ExtensionSigner::new(
                self.extension_provider()?,
            ))),
            LoginParams::LocalKey { secret } => {
                Ok(SignerBackend::LocalKey(LocalKeySigner::parse(&secret)?))
            }
            LoginParams::ReadOnly { public_key } => {
                Ok(SignerBackend::ReadOnly(ReadOnlySigner::parse(&public_key)?))
            }
            LoginParams::RemoteSigner { handshake, triggers } => {
                Ok(SignerBackend::RemoteSigner(handshake.wait(triggers).await?))
            }
            LoginParams::Bunker { uri } => {
                let bunker: BunkerUri = uri.parse()?;
                let signer = RemoteSigner::connect_bunker(
                    self.relay_transport()?,
                    Keys::generate(),
                    &bunker,
                    self.config.remote_request_timeout,
                )
                .await?;
                Ok(SignerBackend::RemoteSigner(signer))
            }
        }
    }

    fn revert_state(&self, previous: AuthState) {
        let mut inner = self.lock();
        if inner.state == AuthState::Authenticating {
            inner.state = previous;
        }
    }

    async fn install(&self, session: Session, backend: Arc<SignerBackend>) {
        let identity = session.identity.clone();
        let previous = {
            let mut inner = self.lock();
            inner.state = AuthState::Authenticated;
            inner.generation += 1;
            inner.active.replace(Active { session, backend })
        };
        if let Some(previous) = previous {
            previous.backend.close().await;
        }
        self.observers.notify(&IdentityChange::Authenticated(identity));
    }

    pub async fn logout(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let previous = {
            let mut inner = self.lock();
            inner.state = AuthState::Unauthenticated;
            inner.generation += 1;
            inner.active.take()
        };
        if let Some(active) = &previous {
            active.backend.close().await;
            info!(identity = %active.session.identity.display_id, "logged out");
        }
        self.store.clear()?;
        self.observers.notify(&IdentityChange::LoggedOut);
        Ok(())
    }

    /// Drop the session after a server-side rejection. No goodbye is sent to the backend.
    pub fn force_clear(&self) {
        self.clear_through(AuthState::Revoked, IdentityChange::Revoked);
    }

    fn clear_through(&self, transient: AuthState, change: IdentityChange) {
        let previous = {
            let mut inner = self.lock();
            inner.state = transient;
            inner.generation += 1;
            inner.active.take()
        };
        if let Some(active) = &previous {
            info!(
                identity = %active.session.identity.display_id,
                state = %transient,
                "session cleared"
            );
        }
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear persisted session");
        }
        self.observers.notify(&change);

        let mut inner = self.lock();
        if inner.state == transient {
            inner.state = AuthState::Unauthenticated;
        }
    }

    /// The live backend with the generation it belongs to.
    pub fn active_backend(&self) -> Result<(Arc<SignerBackend>, u64)> {
        {
            let inner = self.lock();
            match &inner.active {
                None => return Err(GatewayError::capability("no active session")),
                Some(active) if !active.session.is_expired() => {
                    return Ok((active.backend.clone(), inner.generation));
                }
                Some(_) => {}
            }
        }
        self.clear_through(AuthState::Expired, IdentityChange::Expired);
        Err(GatewayError::SessionExpired)
    }

    pub fn signer(&self) -> Result<Arc<SignerBackend>> {
        self.active_backend().map(|(backend, _)| backend)
    }
}

impl fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("IdentityManager")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field(
                "identity",
                &inner.active.as_ref().map(|a| a.session.identity.display_id.clone()),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::MemorySessionStore;

    #[tokio::test]
    async fn test_local_login_and_logout() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = IdentityManager::new(store.clone());
        let keys = Keys::generate();

        let identity = manager
            .login(LoginParams::LocalKey {
                secret: keys.secret_key_hex(),
            })
            .await
            .unwrap();
        assert_eq!(identity.public_key, keys.public_key());
        assert_eq!(manager.state(), AuthState::Authenticated);
        assert_eq!(manager.generation(), 1);
        assert!(store.current().is_some());

        manager.logout().await.unwrap();
        assert_eq!(manager.state(), AuthState::Unauthenticated);
        assert!(manager.current_identity().is_none());
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn test_failed_login_reverts_state() {
        let manager = IdentityManager::new(Arc::new(MemorySessionStore::new()));
        let err = manager
            .login(LoginParams::LocalKey {
                secret: "not a key".into(),
            })
            .await
            .unwrap_err();
        assert!(!matches!(err, GatewayError::SessionExpired));
        assert_eq!(manager.state(), AuthState::Unauthenticated);
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn test_extension_login_requires_provider() {
        let manager = IdentityManager::new(Arc::new(MemorySessionStore::new()));
        let err = manager.login(LoginParams::Extension).await.unwrap_err();
        assert!(matches!(err, GatewayError::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_force_clear_passes_through_revoked() {
        let manager = IdentityManager::new(Arc::new(MemorySessionStore::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            manager.on_identity_change(move |change| seen.lock().unwrap().push(change.clone()))
        };
        manager
            .login(LoginParams::ReadOnly {
                public_key: Keys::generate().public_key().to_npub(),
            })
            .await
            .unwrap();

        manager.force_clear();
        assert_eq!(manager.state(), AuthState::Unauthenticated);
        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], IdentityChange::Authenticated(_)));
        assert_eq!(seen[1], IdentityChange::Revoked);
    }

    #[test]
    fn test_active_backend_without_session() {
        let manager = IdentityManager::new(Arc::new(MemorySessionStore::new()));
        assert!(matches!(
            manager.active_backend(),
            Err(GatewayError::CapabilityUnavailable { .. })
        ));
    }
}
