/*
[INPUT]:  Request URL, method and content type; the identity manager's active backend
[OUTPUT]: `Authorization: Nostr <base64>` header values and guarded 401 recovery
[POS]:    HTTP layer - per-request signed envelope
[UPDATE]: When the auth event layout or recovery rules change
*/

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Method;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{IdentityManager, NostrSigner};
use crate::http::{GatewayError, Result};
use crate::types::{Kind, SignedEvent, UnsignedEvent};

pub const AUTH_SCHEME: &str = "Nostr";

/// Sends the user back to the login flow after a rejection.
pub trait LoginNavigator: Send + Sync {
    fn redirect_to_login(&self);
}

/// Navigator that only logs; used where no UI is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl LoginNavigator for LogNavigator {
    fn redirect_to_login(&self) {
        info!("login required");
    }
}

/// Header value plus the identity generation it was signed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedHeader {
    pub value: String,
    pub generation: u64,
}

/// Kind 27235 template for one request.
pub fn build_auth_event(url: &Url, method: &Method, content_type: &str) -> UnsignedEvent {
    UnsignedEvent::new(Kind::HTTP_AUTH, content_type)
        .tag(["u", url.as_str()])
        .tag(["method", method.as_str()])
}

pub fn encode_header(event: &SignedEvent) -> Result<String> {
    let json = serde_json::to_string(event)?;
    Ok(format!("{AUTH_SCHEME} {}", STANDARD.encode(json)))
}

/// Parse and verify an `Authorization` header value.
pub fn decode_header(value: &str) -> Result<SignedEvent> {
    let encoded = value
        .strip_prefix(AUTH_SCHEME)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| GatewayError::InvalidResponse(format!("not a {AUTH_SCHEME} header")))?;
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GatewayError::InvalidResponse(format!("bad header encoding: {e}")))?;
    let event: SignedEvent = serde_json::from_slice(&json)?;
    event.verify()?;
    Ok(event)
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RequestAuthenticator {
    identity: Arc<IdentityManager>,
    enabled: bool,
    redirecting: AtomicBool,
    navigator: Arc<dyn LoginNavigator>,
}

impl RequestAuthenticator {
    pub fn new(identity: Arc<IdentityManager>, navigator: Arc<dyn LoginNavigator>) -> Self {
        Self {
            identity,
            enabled: true,
            redirecting: AtomicBool::new(false),
            navigator,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    /// Sign the envelope for one request.
    ///
    /// Returns `Ok(None)` when authentication is disabled or nobody is logged in.
    /// An expired session triggers the same recovery as a 401.
    pub async fn authorize(
        &self,
        url: &Url,
        method: &Method,
        content_type: &str,
    ) -> Result<Option<AuthorizedHeader>> {
        if !self.enabled {
            return Ok(None);
        }
        let (backend, generation) = match self.identity.active_backend() {
            Ok(active) => active,
            Err(GatewayError::CapabilityUnavailable { .. }) => return Ok(None),
            Err(GatewayError::SessionExpired) => {
                self.handle_rejection(None);
                return Err(GatewayError::SessionExpired);
            }
            Err(err) => return Err(err),
        };

        let signed = backend
            .sign_event(build_auth_event(url, method, content_type))
            .await?;
        debug!(url = %url, method = %method, event = %signed.id, "request signed");
        Ok(Some(AuthorizedHeader {
            value: encode_header(&signed)?,
            generation,
        }))
    }

    /// Recover from a server-side rejection. Returns true if this call navigated.
    ///
    /// `signed_generation` is the generation the rejected request was signed
    /// under; a newer identity means someone already recovered.
    pub fn handle_rejection(&self, signed_generation: Option<u64>) -> bool {
        if !self.enabled {
            return false;
        }
        if self.is_stale(signed_generation) {
            return false;
        }
        if self
            .redirecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("login redirect already in progress");
            return false;
        }
        let _reset = ResetOnDrop(&self.redirecting);
        // generation may have moved while we raced for the flag
        if self.is_stale(signed_generation) {
            return false;
        }

        warn!(generation = ?signed_generation, "request rejected, clearing identity");
        self.identity.force_clear();
        self.navigator.redirect_to_login();
        true
    }

    fn is_stale(&self, signed_generation: Option<u64>) -> bool {
        match signed_generation {
            Some(generation) => generation != self.identity.generation(),
            None => false,
        }
    }
}

impl fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("enabled", &self.enabled)
            .field("redirecting", &self.redirecting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Keys, LoginParams, MemorySessionStore};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingNavigator(AtomicUsize);

    impl LoginNavigator for CountingNavigator {
        fn redirect_to_login(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn logged_in() -> (Arc<IdentityManager>, Keys) {
        let keys = Keys::generate();
        let manager = Arc::new(IdentityManager::new(Arc::new(MemorySessionStore::new())));
        manager
            .login(LoginParams::LocalKey {
                secret: keys.secret_key_hex(),
            })
            .await
            .unwrap();
        (manager, keys)
    }

    #[test]
    fn test_auth_event_layout() {
        let url = Url::parse("https://api.example/api/mints?x=1").unwrap();
        let event = build_auth_event(&url, &Method::POST, "application/json");
        assert_eq!(event.kind, Kind::HTTP_AUTH);
        assert_eq!(event.content, "application/json");
        assert_eq!(
            event.tags,
            vec![
                vec!["u".to_string(), "https://api.example/api/mints?x=1".to_string()],
                vec!["method".to_string(), "POST".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_header_decodes_to_signed_event() {
        let (manager, keys) = logged_in().await;
        let auth = RequestAuthenticator::new(manager, Arc::new(LogNavigator));
        let url = Url::parse("https://api.example/api/mints").unwrap();
        let header = auth
            .authorize(&url, &Method::GET, "application/json")
            .await
            .unwrap()
            .unwrap();
        assert!(header.value.starts_with("Nostr "));

        let event = decode_header(&header.value).unwrap();
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(event.tag_value("u"), Some(url.as_str()));
        assert_eq!(event.tag_value("method"), Some("GET"));
    }

    #[tokio::test]
    async fn test_disabled_builds_nothing() {
        let (manager, _) = logged_in().await;
        let navigator = Arc::new(CountingNavigator::default());
        let auth = RequestAuthenticator::new(manager.clone(), navigator.clone()).with_enabled(false);
        let url = Url::parse("https://api.example/").unwrap();
        assert!(auth.authorize(&url, &Method::GET, "").await.unwrap().is_none());
        assert!(!auth.handle_rejection(Some(manager.generation())));
        assert_eq!(navigator.0.load(Ordering::SeqCst), 0);
        assert!(manager.current_identity().is_some());
    }

    #[tokio::test]
    async fn test_stale_rejection_is_ignored() {
        let (manager, _) = logged_in().await;
        let navigator = Arc::new(CountingNavigator::default());
        let auth = RequestAuthenticator::new(manager.clone(), navigator.clone());
        let stale = manager.generation() - 1;
        assert!(!auth.handle_rejection(Some(stale)));
        assert!(manager.current_identity().is_some());

        assert!(auth.handle_rejection(Some(manager.generation())));
        assert!(manager.current_identity().is_none());
        assert_eq!(navigator.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_rejects_other_schemes() {
        assert!(decode_header("Bearer abc").is_err());
        assert!(decode_header("Nostr !!!").is_err());
    }
}
