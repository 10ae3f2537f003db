/*
[INPUT]:  Relay transport, app metadata, completion triggers (relay, focus, bunker string, cancel)
[OUTPUT]: A bound RemoteSigner or a timeout/cancel error; nostrconnect URI for presentation
[POS]:    Auth layer - remote signer pairing
[UPDATE]: When pairing channels or permission sets change
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::keys::Keys;
use super::remote::{
    DEFAULT_REQUEST_TIMEOUT, RemoteSigner, RpcMessage, RpcResponse, open_rpc, seal_rpc,
};
use super::signer::NostrSigner;
use super::uri::{BunkerUri, ConnectionRequest, Permission};
use crate::http::{GatewayError, Result};
use crate::relay::{Filter, RelaySubscription, RelayTransport};
use crate::types::{ClientContext, Kind, PublicKey, SignedEvent};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const FOCUS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
// tolerate signer clocks running slightly behind ours
const RESPONSE_LOOKBACK_SECS: u64 = 10;

/// Handshake configuration
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub relays: Vec<Url>,
    pub app_name: String,
    pub app_url: String,
    pub sign_kinds: Vec<Kind>,
    pub timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            app_name: "nostr-gateway".to_string(),
            app_url: String::new(),
            sign_kinds: vec![
                Kind::HTTP_AUTH,
                Kind::TOKEN_SET,
                Kind::SPENDING_HISTORY,
                Kind::PAYMENT_QUOTE,
                Kind::WALLET_CONFIG,
                Kind::DELETION,
            ],
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// How the connection request should reach the companion signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presentation {
    /// Open the URI directly (mobile deep link into the signer app).
    HandOff(String),
    /// Render the URI for scanning (desktop QR code).
    Display(String),
}

impl Presentation {
    pub fn uri(&self) -> &str {
        match self {
            Presentation::HandOff(uri) | Presentation::Display(uri) => uri,
        }
    }
}

/// Receiving side of the completion channels, consumed by `wait`.
#[derive(Debug)]
pub struct HandshakeTriggers {
    focus: mpsc::Receiver<()>,
    manual: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

/// Sending side, held by whoever drives the UI.
#[derive(Debug, Clone)]
pub struct HandshakeControls {
    focus: mpsc::Sender<()>,
    manual: mpsc::Sender<String>,
    cancel: CancellationToken,
}

pub fn handshake_triggers() -> (HandshakeTriggers, HandshakeControls) {
    let (focus_tx, focus_rx) = mpsc::channel(4);
    let (manual_tx, manual_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    (
        HandshakeTriggers {
            focus: focus_rx,
            manual: manual_rx,
            cancel: cancel.clone(),
        },
        HandshakeControls {
            focus: focus_tx,
            manual: manual_tx,
            cancel,
        },
    )
}

impl HandshakeControls {
    /// The app regained focus; re-check the relay for a missed response.
    pub fn notify_focus(&self) {
        let _ = self.focus.try_send(());
    }

    /// Submit a `bunker://` string pasted by the user.
    pub async fn submit_bunker(&self, uri: impl Into<String>) -> Result<()> {
        self.manual
            .send(uri.into())
            .await
            .map_err(|_| GatewayError::Cancelled)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum Examined {
    Ignore,
    Bound { remote: PublicKey, ack_id: Option<String> },
}

/// One pairing attempt: ephemeral keys, secret and connection request.
pub struct RemoteSignerHandshake {
    transport: Arc<dyn RelayTransport>,
    config: HandshakeConfig,
    client_keys: Keys,
    request: ConnectionRequest,
    started_at: u64,
}

impl RemoteSignerHandshake {
    pub fn new(transport: Arc<dyn RelayTransport>, config: HandshakeConfig) -> Result<Self> {
        if config.relays.is_empty() {
            return Err(GatewayError::Config(
                "remote signer handshake needs at least one relay".into(),
            ));
        }

        // 1. Ephemeral client keys
        let client_keys = Keys::generate();

        // 2. Random secret proving the response belongs to this request
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);

        // 3. Connection request
        let mut perms: Vec<Permission> = config
            .sign_kinds
            .iter()
            .copied()
            .map(Permission::SignEvent)
            .collect();
        perms.push(Permission::Nip44Encrypt);
        perms.push(Permission::Nip44Decrypt);
        let request = ConnectionRequest {
            client_pubkey: client_keys.public_key(),
            relays: config.relays.clone(),
            secret: hex::encode(secret),
            perms,
            name: config.app_name.clone(),
            url: config.app_url.clone(),
        };

        Ok(Self {
            transport,
            config,
            client_keys,
            request,
            started_at: Utc::now().timestamp().max(0) as u64,
        })
    }

    pub fn request(&self) -> &ConnectionRequest {
        &self.request
    }

    pub fn uri(&self) -> String {
        self.request.to_uri()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// 4. Present according to the runtime context
    pub fn present(&self, context: ClientContext) -> Presentation {
        match context {
            ClientContext::Mobile => Presentation::HandOff(self.uri()),
            ClientContext::Desktop => Presentation::Display(self.uri()),
        }
    }

    fn response_filter(&self) -> Filter {
        Filter::new()
            .kind(Kind::NOSTR_CONNECT)
            .pubkey_tag(self.client_keys.public_key())
            .since(self.started_at.saturating_sub(RESPONSE_LOOKBACK_SECS))
    }

    /// 5. Wait for the first completion channel to succeed, bounded by the timeout.
    pub async fn wait(self, mut triggers: HandshakeTriggers) -> Result<RemoteSigner> {
        let deadline = Instant::now() + self.config.timeout;
        self.transport.add_relays(&self.config.relays).await?;
        let mut subscription = self.transport.subscribe(self.response_filter()).await?;

        let outcome = self.race(&mut subscription, &mut triggers, deadline).await;
        if let Err(err) = self.transport.unsubscribe(&subscription.id).await {
            debug!(error = %err, "handshake unsubscribe failed");
        }

        let completion = outcome?;
        tokio::time::timeout_at(deadline, self.finish(completion))
            .await
            .map_err(|_| {
                warn!(timeout_secs = self.config.timeout.as_secs(), "remote signer pairing timed out while binding");
                GatewayError::HandshakeTimeout {
                    seconds: self.config.timeout.as_secs(),
                }
            })?
    }

    // Binding and the first get_public_key share the handshake deadline.
    async fn finish(&self, completion: Completion) -> Result<RemoteSigner> {
        let signer = match completion {
            Completion::Relay(remote) => {
                RemoteSigner::bind(
                    self.transport.clone(),
                    self.client_keys.clone(),
                    remote,
                    self.config.relays.iter().map(|relay| relay.to_string()).collect(),
                    Some(self.request.secret.clone()),
                    self.config.request_timeout,
                )
                .await?
            }
            Completion::Bunker(signer) => signer,
        };

        if let Err(err) = signer.get_public_key().await {
            signer.close().await;
            return Err(err);
        }
        info!(remote = %signer.remote_pubkey(), "remote signer paired");
        Ok(signer)
    }

    async fn race(
        &self,
        subscription: &mut RelaySubscription,
        triggers: &mut HandshakeTriggers,
        deadline: Instant,
    ) -> Result<Completion> {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        let mut relay_open = true;
        let mut focus_open = true;
        let mut manual_open = true;

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    warn!(timeout_secs = self.config.timeout.as_secs(), "remote signer handshake timed out");
                    return Err(GatewayError::HandshakeTimeout {
                        seconds: self.config.timeout.as_secs(),
                    });
                }
                _ = triggers.cancel.cancelled() => {
                    return Err(GatewayError::Cancelled);
                }
                incoming = subscription.events.recv(), if relay_open => match incoming {
                    Some(event) => {
                        if let Some(remote) = self.settle(&event).await {
                            return Ok(Completion::Relay(remote));
                        }
                    }
                    None => {
                        warn!("handshake relay subscription closed");
                        relay_open = false;
                    }
                },
                signal = triggers.focus.recv(), if focus_open => match signal {
                    Some(()) => {
                        if let Some(remote) = self.recheck(deadline).await {
                            return Ok(Completion::Relay(remote));
                        }
                    }
                    None => focus_open = false,
                },
                manual = triggers.manual.recv(), if manual_open => match manual {
                    Some(uri) => match self.bind_bunker(&uri, deadline).await {
                        Ok(signer) => return Ok(Completion::Bunker(signer)),
                        Err(err) => warn!(error = %err, "bunker connection failed, still waiting"),
                    },
                    None => manual_open = false,
                },
            }
        }
    }

    /// Advisory re-check on focus: fetch what the subscription may have missed.
    async fn recheck(&self, deadline: Instant) -> Option<PublicKey> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let events = match self
            .transport
            .fetch(self.response_filter(), remaining.min(FOCUS_FETCH_TIMEOUT))
            .await
        {
            Ok(events) => events,
            Err(err) => {
                debug!(error = %err, "focus re-check fetch failed");
                return None;
            }
        };
        for event in events {
            if let Some(remote) = self.settle(&event).await {
                return Some(remote);
            }
        }
        None
    }

    async fn settle(&self, event: &SignedEvent) -> Option<PublicKey> {
        match self.examine(event) {
            Examined::Ignore => None,
            Examined::Bound { remote, ack_id } => {
                if let Some(id) = ack_id {
                    self.acknowledge(&remote, id).await;
                }
                Some(remote)
            }
        }
    }

    fn examine(&self, event: &SignedEvent) -> Examined {
        let message = match open_rpc(&self.client_keys, event) {
            Ok(message) => message,
            Err(err) => {
                debug!(event_id = %event.id, error = %err, "ignoring handshake candidate");
                return Examined::Ignore;
            }
        };
        let secret = self.request.secret.as_str();
        match message {
            RpcMessage::Response(response) => {
                if response.result.as_deref() == Some(secret) {
                    return Examined::Bound {
                        remote: event.pubkey,
                        ack_id: None,
                    };
                }
                // error responses carry no secret and never end the wait
                if let Some(error) = response.error.filter(|error| !error.is_empty()) {
                    warn!(author = %event.pubkey, error = %error, "ignoring connect rejection");
                }
                Examined::Ignore
            }
            RpcMessage::Request(request) if request.method == "connect" => {
                let author = event.pubkey.to_hex();
                let claims_author = request.params.first().map(String::as_str) == Some(author.as_str());
                let carries_secret = request.params.get(1).map(String::as_str) == Some(secret);
                if claims_author && carries_secret {
                    Examined::Bound {
                        remote: event.pubkey,
                        ack_id: Some(request.id),
                    }
                } else {
                    Examined::Ignore
                }
            }
            RpcMessage::Request(_) => Examined::Ignore,
        }
    }

    async fn acknowledge(&self, remote: &PublicKey, id: String) {
        let response = RpcResponse {
            id,
            result: Some("ack".to_string()),
            error: None,
        };
        let published = match seal_rpc(&self.client_keys, remote, &response) {
            Ok(event) => self.transport.publish(&event).await,
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            warn!(error = %err, "could not acknowledge remote signer connect");
        }
    }

    async fn bind_bunker(&self, raw: &str, deadline: Instant) -> Result<RemoteSigner> {
        let bunker: BunkerUri = raw.parse()?;
        tokio::time::timeout_at(
            deadline,
            RemoteSigner::connect_bunker(
                self.transport.clone(),
                self.client_keys.clone(),
                &bunker,
                self.config.request_timeout,
            ),
        )
        .await
        .map_err(|_| GatewayError::HandshakeTimeout {
            seconds: self.config.timeout.as_secs(),
        })?
    }
}

impl std::fmt::Debug for RemoteSignerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSignerHandshake")
            .field("client_pubkey", &self.client_keys.public_key())
            .field("relays", &self.config.relays)
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

enum Completion {
    Relay(PublicKey),
    Bunker(RemoteSigner),
}
