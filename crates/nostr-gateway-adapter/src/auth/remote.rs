/*
[INPUT]:  Client keys bound to a remote signer pubkey, relay transport
[OUTPUT]: NIP-46 JSON-RPC calls (get_public_key, sign_event, nip44_*) with verified results
[POS]:    Auth layer - remote signer backend
[UPDATE]: When adding RPC methods or changing response handling
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::keys::Keys;
use super::signer::NostrSigner;
use super::uri::BunkerUri;
use crate::http::{GatewayError, Result};
use crate::relay::{Filter, RelayTransport};
use crate::types::{Kind, PublicKey, SignedEvent, UnsignedEvent};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_URL_RESULT: &str = "auth_url";
const ACK_RESULT: &str = "ack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decrypted kind-24133 content. Requests carry `method`, so they are tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Everything needed to rebind a remote signer without a new handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBinding {
    pub client_secret_key: String,
    pub remote_signer_pubkey: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pubkey: Option<PublicKey>,
    pub relays: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Encrypt, sign and p-tag one RPC payload for `recipient`.
pub fn seal_rpc<T: Serialize>(keys: &Keys, recipient: &PublicKey, payload: &T) -> Result<SignedEvent> {
    let plaintext = serde_json::to_string(payload)?;
    let content = keys.encrypt(recipient, &plaintext)?;
    keys.sign_event(
        UnsignedEvent::new(Kind::NOSTR_CONNECT, content).tag(["p".to_string(), recipient.to_hex()]),
    )
}

/// Decrypt one kind-24133 event addressed to `keys`.
pub fn open_rpc(keys: &Keys, event: &SignedEvent) -> Result<RpcMessage> {
    if event.kind != Kind::NOSTR_CONNECT {
        return Err(GatewayError::InvalidResponse(format!(
            "kind {} is not a signer message",
            event.kind
        )));
    }
    event.verify()?;
    let plaintext = keys.decrypt(&event.pubkey, &event.content)?;
    Ok(serde_json::from_str(&plaintext)?)
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

fn lock_pending(pending: &Pending) -> MutexGuard<'_, HashMap<String, oneshot::Sender<RpcResponse>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Remote signer backend bound to one client keypair and one signer pubkey.
pub struct RemoteSigner {
    transport: Arc<dyn RelayTransport>,
    client_keys: Keys,
    remote_pubkey: PublicKey,
    relays: Vec<String>,
    secret: Option<String>,
    user_pubkey: RwLock<Option<PublicKey>>,
    pending: Pending,
    subscription_id: String,
    pump: JoinHandle<()>,
    request_timeout: Duration,
}

impl RemoteSigner {
    /// Subscribe for responses addressed to `client_keys` and start routing them.
    pub async fn bind(
        transport: Arc<dyn RelayTransport>,
        client_keys: Keys,
        remote_pubkey: PublicKey,
        relays: Vec<String>,
        secret: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let filter = Filter::new()
            .kind(Kind::NOSTR_CONNECT)
            .author(remote_pubkey)
            .pubkey_tag(client_keys.public_key());
        let subscription = transport.subscribe(filter).await?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(pump_responses(
            subscription.events,
            client_keys.clone(),
            remote_pubkey,
            pending.clone(),
        ));

        debug!(remote = %remote_pubkey, client = %client_keys.public_key(), "remote signer bound");
        Ok(Self {
            transport,
            client_keys,
            remote_pubkey,
            relays,
            secret,
            user_pubkey: RwLock::new(None),
            pending,
            subscription_id: subscription.id,
            pump,
            request_timeout,
        })
    }

    /// Rebind a persisted session. No RPC is sent.
    pub async fn from_binding(
        transport: Arc<dyn RelayTransport>,
        binding: &RemoteBinding,
        request_timeout: Duration,
    ) -> Result<Self> {
        let relays = binding
            .relays
            .iter()
            .map(|relay| Url::parse(relay))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        transport.add_relays(&relays).await?;
        let client_keys = Keys::parse(&binding.client_secret_key)?;
        let signer = Self::bind(
            transport,
            client_keys,
            binding.remote_signer_pubkey,
            binding.relays.clone(),
            binding.secret.clone(),
            request_timeout,
        )
        .await?;
        if let Some(user) = binding.user_pubkey {
            signer.set_user_pubkey(user);
        }
        Ok(signer)
    }

    /// Bind from a `bunker://` string and complete the `connect` RPC.
    pub async fn connect_bunker(
        transport: Arc<dyn RelayTransport>,
        client_keys: Keys,
        bunker: &BunkerUri,
        request_timeout: Duration,
    ) -> Result<Self> {
        transport.add_relays(&bunker.relays).await?;
        let signer = Self::bind(
            transport,
            client_keys,
            bunker.remote_signer_pubkey,
            bunker.relays.iter().map(|relay| relay.to_string()).collect(),
            bunker.secret.clone(),
            request_timeout,
        )
        .await?;
        if let Err(err) = signer.connect().await {
            signer.close().await;
            return Err(err);
        }
        Ok(signer)
    }

    pub fn remote_pubkey(&self) -> PublicKey {
        self.remote_pubkey
    }

    pub fn client_pubkey(&self) -> PublicKey {
        self.client_keys.public_key()
    }

    pub fn binding(&self) -> RemoteBinding {
        RemoteBinding {
            client_secret_key: self.client_keys.secret_key_hex(),
            remote_signer_pubkey: self.remote_pubkey,
            user_pubkey: self.cached_user_pubkey(),
            relays: self.relays.clone(),
            secret: self.secret.clone(),
        }
    }

    fn cached_user_pubkey(&self) -> Option<PublicKey> {
        match self.user_pubkey.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_user_pubkey(&self, key: PublicKey) {
        match self.user_pubkey.write() {
            Ok(mut guard) => *guard = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
    }

    /// `connect` RPC; the signer answers `ack` or echoes the secret.
    pub async fn connect(&self) -> Result<()> {
        let mut params = vec![self.remote_pubkey.to_hex()];
        if let Some(secret) = &self.secret {
            params.push(secret.clone());
        }
        let result = self.rpc("connect", params).await?;
        if result == ACK_RESULT || self.secret.as_deref() == Some(result.as_str()) {
            info!(remote = %self.remote_pubkey, "remote signer connected");
            Ok(())
        } else {
            Err(GatewayError::InvalidResponse(format!(
                "unexpected connect result: {result}"
            )))
        }
    }

    /// Stop routing responses and close the relay subscription.
    pub async fn close(&self) {
        self.pump.abort();
        if let Err(err) = self.transport.unsubscribe(&self.subscription_id).await {
            debug!(error = %err, "remote signer unsubscribe failed");
        }
        lock_pending(&self.pending).clear();
    }

    async fn rpc(&self, method: &str, params: Vec<String>) -> Result<String> {
        let request = RpcRequest {
            id: Uuid::new_v4().simple().to_string(),
            method: method.to_string(),
            params,
        };
        let event = seal_rpc(&self.client_keys, &self.remote_pubkey, &request)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request.id.clone(), tx);
        if let Err(err) = self.transport.publish(&event).await {
            lock_pending(&self.pending).remove(&request.id);
            return Err(err);
        }
        debug!(method, id = %request.id, "remote signer request sent");

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(GatewayError::NetworkOrRelay(
                    "remote signer response channel closed".into(),
                ));
            }
            Err(_) => {
                lock_pending(&self.pending).remove(&request.id);
                return Err(GatewayError::Timeout {
                    duration: self.request_timeout.as_secs(),
                });
            }
        };

        if let Some(error) = response.error.filter(|error| !error.is_empty()) {
            return Err(GatewayError::denied(method, error));
        }
        response
            .result
            .ok_or_else(|| GatewayError::InvalidResponse(format!("{method} response without result")))
    }
}

async fn pump_responses(
    mut events: mpsc::Receiver<SignedEvent>,
    client_keys: Keys,
    remote_pubkey: PublicKey,
    pending: Pending,
) {
    while let Some(event) = events.recv().await {
        if event.pubkey != remote_pubkey {
            continue;
        }
        let response = match open_rpc(&client_keys, &event) {
            Ok(RpcMessage::Response(response)) => response,
            Ok(RpcMessage::Request(request)) => {
                debug!(method = %request.method, "ignoring request from remote signer");
                continue;
            }
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "undecodable remote signer message");
                continue;
            }
        };

        if response.result.as_deref() == Some(AUTH_URL_RESULT) {
            // the signer wants the user to approve elsewhere; the real answer follows
            info!(
                id = %response.id,
                url = response.error.as_deref().unwrap_or_default(),
                "remote signer requested out-of-band approval"
            );
            continue;
        }

        let waiter = lock_pending(&pending).remove(&response.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(id = %response.id, "response for unknown request"),
        }
    }
}

impl Drop for RemoteSigner {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl fmt::Debug for RemoteSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSigner")
            .field("remote_pubkey", &self.remote_pubkey)
            .field("client_pubkey", &self.client_keys.public_key())
            .field("relays", &self.relays)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NostrSigner for RemoteSigner {
    async fn get_public_key(&self) -> Result<PublicKey> {
        if let Some(key) = self.cached_user_pubkey() {
            return Ok(key);
        }
        let result = self.rpc("get_public_key", Vec::new()).await?;
        let key = PublicKey::parse(&result)?;
        self.set_user_pubkey(key);
        Ok(key)
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<SignedEvent> {
        let template = serde_json::to_string(&event)?;
        let result = self.rpc("sign_event", vec![template]).await?;
        let signed: SignedEvent = serde_json::from_str(&result)?;
        signed.verify()?;
        if signed.kind != event.kind || signed.content != event.content || signed.tags != event.tags {
            return Err(GatewayError::VerificationFailed(
                "remote signer altered the event template".into(),
            ));
        }
        if let Some(user) = self.cached_user_pubkey() {
            if signed.pubkey != user {
                return Err(GatewayError::VerificationFailed(format!(
                    "remote signer signed with {} instead of {}",
                    signed.pubkey, user
                )));
            }
        }
        Ok(signed)
    }

    async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String> {
        self.rpc("nip44_encrypt", vec![peer.to_hex(), plaintext.to_string()])
            .await
    }

    async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        self.rpc("nip44_decrypt", vec![peer.to_hex(), ciphertext.to_string()])
            .await
    }
}
