/*
[INPUT]:  Test configuration, mock server and relay requirements
[OUTPUT]: Shared test utilities, fixtures and an in-process remote signer
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for nostr-gateway-adapter tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nostr_gateway_adapter::auth::{
    ConnectionRequest, RpcMessage, RpcRequest, RpcResponse, open_rpc, seal_rpc,
};
use nostr_gateway_adapter::{
    Filter, Keys, Kind, MemoryRelay, Proof, PublicKey, RelayTransport, UnsignedEvent,
};
use tokio::task::JoinHandle;
use wiremock::MockServer;

pub const TEST_MINT: &str = "https://mint.example";
pub const TEST_RELAY: &str = "wss://relay.example";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

pub fn memory_relay() -> Arc<MemoryRelay> {
    Arc::new(MemoryRelay::new())
}

pub fn proof(amount: u64, secret: &str) -> Proof {
    Proof::new("009a1f293253e41e", amount, secret, "02698c4e2b5f9534cd0687d87513c759790cf829aa5739184a3e3735471fbda904")
}

/// In-process NIP-46 signer answering over a `MemoryRelay`.
///
/// Uses separate keys for the RPC transport and for the user identity so
/// `get_public_key` is actually exercised.
pub struct SignerService {
    pub signer_keys: Keys,
    pub user_keys: Keys,
    relay: Arc<MemoryRelay>,
    deny_signing: Arc<AtomicBool>,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SignerService {
    pub async fn start(relay: Arc<MemoryRelay>) -> Self {
        Self::start_with(relay, Keys::generate()).await
    }

    pub async fn start_with(relay: Arc<MemoryRelay>, user_keys: Keys) -> Self {
        let signer_keys = Keys::generate();
        let deny_signing = Arc::new(AtomicBool::new(false));
        let requests = Arc::new(AtomicUsize::new(0));
        let filter = Filter::new()
            .kind(Kind::NOSTR_CONNECT)
            .pubkey_tag(signer_keys.public_key());
        let mut subscription = relay.subscribe(filter).await.unwrap();

        let task = {
            let relay = relay.clone();
            let signer_keys = signer_keys.clone();
            let user_keys = user_keys.clone();
            let deny_signing = deny_signing.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    let Ok(RpcMessage::Request(request)) = open_rpc(&signer_keys, &event) else {
                        continue;
                    };
                    requests.fetch_add(1, Ordering::SeqCst);
                    let response = answer(&user_keys, &request, deny_signing.load(Ordering::SeqCst));
                    let reply = seal_rpc(&signer_keys, &event.pubkey, &response).unwrap();
                    relay.publish(&reply).await.unwrap();
                }
            })
        };

        Self {
            signer_keys,
            user_keys,
            relay,
            deny_signing,
            requests,
            task,
        }
    }

    pub fn bunker_uri(&self, secret: Option<&str>) -> String {
        let mut uri = format!(
            "bunker://{}?relay={}",
            self.signer_keys.public_key().to_hex(),
            TEST_RELAY
        );
        if let Some(secret) = secret {
            uri.push_str("&secret=");
            uri.push_str(secret);
        }
        uri
    }

    /// Answer a nostrconnect request the way a signer app does after the user approves it.
    pub async fn accept(&self, uri: &str) {
        let request = ConnectionRequest::parse(uri).unwrap();
        let response = RpcResponse {
            id: uuid::Uuid::new_v4().simple().to_string(),
            result: Some(request.secret.clone()),
            error: None,
        };
        self.send_to(&request.client_pubkey, &response).await;
    }

    /// Send a signer-initiated `connect` request carrying the secret.
    pub async fn connect_request(&self, uri: &str) {
        let request = ConnectionRequest::parse(uri).unwrap();
        let message = RpcRequest {
            id: "connect-1".into(),
            method: "connect".into(),
            params: vec![self.signer_keys.public_key().to_hex(), request.secret.clone()],
        };
        let event = seal_rpc(&self.signer_keys, &request.client_pubkey, &message).unwrap();
        self.relay.publish(&event).await.unwrap();
    }

    pub async fn reject(&self, uri: &str, reason: &str) {
        let request = ConnectionRequest::parse(uri).unwrap();
        let response = RpcResponse {
            id: "reject-1".into(),
            result: None,
            error: Some(reason.to_string()),
        };
        self.send_to(&request.client_pubkey, &response).await;
    }

    async fn send_to(&self, client: &PublicKey, response: &RpcResponse) {
        let event = seal_rpc(&self.signer_keys, client, response).unwrap();
        self.relay.publish(&event).await.unwrap();
    }

    pub fn set_deny_signing(&self, deny: bool) {
        self.deny_signing.store(deny, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for SignerService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn answer(user_keys: &Keys, request: &RpcRequest, deny_signing: bool) -> RpcResponse {
    let outcome: Result<String, String> = match request.method.as_str() {
        "connect" => Ok("ack".to_string()),
        "get_public_key" => Ok(user_keys.public_key().to_hex()),
        "sign_event" if deny_signing => Err("user rejected signing".to_string()),
        "sign_event" => request
            .params
            .first()
            .ok_or_else(|| "missing template".to_string())
            .and_then(|raw| serde_json::from_str::<UnsignedEvent>(raw).map_err(|e| e.to_string()))
            .and_then(|template| user_keys.sign_event(template).map_err(|e| e.to_string()))
            .and_then(|signed| serde_json::to_string(&signed).map_err(|e| e.to_string())),
        "nip44_encrypt" => peer_and_payload(request)
            .and_then(|(peer, plaintext)| user_keys.encrypt(&peer, plaintext).map_err(|e| e.to_string())),
        "nip44_decrypt" => peer_and_payload(request)
            .and_then(|(peer, payload)| user_keys.decrypt(&peer, payload).map_err(|e| e.to_string())),
        other => Err(format!("unsupported method {other}")),
    };
    match outcome {
        Ok(result) => RpcResponse {
            id: request.id.clone(),
            result: Some(result),
            error: None,
        },
        Err(error) => RpcResponse {
            id: request.id.clone(),
            result: None,
            error: Some(error),
        },
    }
}

fn peer_and_payload(request: &RpcRequest) -> Result<(PublicKey, &str), String> {
    let peer = request
        .params
        .first()
        .ok_or_else(|| "missing peer".to_string())
        .and_then(|raw| PublicKey::parse(raw).map_err(|e| e.to_string()))?;
    let payload = request
        .params
        .get(1)
        .ok_or_else(|| "missing payload".to_string())?;
    Ok((peer, payload.as_str()))
}
