/*
[INPUT]:  Mock HTTP responses and a logged-in identity manager
[OUTPUT]: Test results for signed requests, error mapping and 401 recovery
[POS]:    Integration tests - HTTP endpoints
[UPDATE]: When HTTP endpoints or the auth envelope change
*/

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::setup_mock_server;
use nostr_gateway_adapter::http::decode_header;
use nostr_gateway_adapter::{
    AuthState, ClientConfig, GatewayClient, GatewayError, IdentityManager, Keys, Kind,
    LoginNavigator, LoginParams, MemorySessionStore, RequestAuthenticator,
};
use rstest::rstest;
use serde_json::{Value, json};
use tokio_test::assert_ok;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct CountingNavigator(AtomicUsize);

impl CountingNavigator {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl LoginNavigator for CountingNavigator {
    fn redirect_to_login(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    server: MockServer,
    client: GatewayClient,
    manager: Arc<IdentityManager>,
    navigator: Arc<CountingNavigator>,
    keys: Keys,
}

async fn harness(enabled: bool) -> Harness {
    let server = setup_mock_server().await;
    let manager = Arc::new(IdentityManager::new(Arc::new(MemorySessionStore::new())));
    let keys = Keys::generate();
    assert_ok!(
        manager
            .login(LoginParams::LocalKey {
                secret: keys.secret_key_hex(),
            })
            .await
    );
    let navigator = Arc::new(CountingNavigator::default());
    let authenticator = Arc::new(
        RequestAuthenticator::new(manager.clone(), navigator.clone()).with_enabled(enabled),
    );
    let client = assert_ok!(GatewayClient::new(&server.uri())).with_authenticator(authenticator);
    Harness {
        server,
        client,
        manager,
        navigator,
        keys,
    }
}

fn authorization(request: &wiremock::Request) -> Option<String> {
    request
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn test_get_carries_signed_envelope() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/mints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"mints": []})))
        .expect(1)
        .mount(&h.server)
        .await;

    let body: Value = assert_ok!(h.client.get("/api/mints").await);
    assert_eq!(body["mints"], json!([]));

    let requests = h.server.received_requests().await.unwrap();
    let value = authorization(&requests[0]).expect("authorization header");
    assert!(value.starts_with("Nostr "));
    let event = assert_ok!(decode_header(&value));
    assert_eq!(event.kind, Kind::HTTP_AUTH);
    assert_eq!(event.pubkey, h.keys.public_key());
    assert_eq!(event.tag_value("u"), Some(requests[0].url.as_str()));
    assert_eq!(event.tag_value("method"), Some("GET"));
    assert_eq!(event.content, "application/json");
}

#[tokio::test]
async fn test_post_signs_method_and_sends_body() {
    let h = harness(true).await;
    Mock::given(method("POST"))
        .and(path("/api/wallet/spend"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&h.server)
        .await;

    let body: Value = assert_ok!(
        h.client
            .post_json("/api/wallet/spend", &json!({"amount": 100}))
            .await
    );
    assert_eq!(body["ok"], true);

    let requests = h.server.received_requests().await.unwrap();
    let event = assert_ok!(decode_header(&authorization(&requests[0]).unwrap()));
    assert_eq!(event.tag_value("method"), Some("POST"));
    let sent: Value = assert_ok!(serde_json::from_slice(&requests[0].body));
    assert_eq!(sent["amount"], 100);
}

#[tokio::test]
async fn test_disabled_auth_sends_no_header() {
    let h = harness(false).await;
    Mock::given(method("GET"))
        .and(path("/api/mints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&h.server)
        .await;

    let _: Value = assert_ok!(h.client.get("/api/mints").await);
    let requests = h.server.received_requests().await.unwrap();
    assert!(authorization(&requests[0]).is_none());
}

#[tokio::test]
async fn test_public_get_skips_signing() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "gateway"})))
        .mount(&h.server)
        .await;

    let body: Value = assert_ok!(h.client.get_public("/api/info").await);
    assert_eq!(body["name"], "gateway");
    let requests = h.server.received_requests().await.unwrap();
    assert!(authorization(&requests[0]).is_none());
}

#[tokio::test]
async fn test_logged_out_request_goes_unsigned() {
    let h = harness(true).await;
    assert_ok!(h.manager.logout().await);
    Mock::given(method("GET"))
        .and(path("/api/mints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&h.server)
        .await;

    let _: Value = assert_ok!(h.client.get("/api/mints").await);
    let requests = h.server.received_requests().await.unwrap();
    assert!(authorization(&requests[0]).is_none());
}

#[tokio::test]
async fn test_unauthorized_clears_identity_and_navigates() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/balance"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad auth"))
        .mount(&h.server)
        .await;

    let err = h.client.get::<Value>("/api/balance").await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(matches!(err, GatewayError::Api { code: 401, .. }));
    assert_eq!(h.navigator.count(), 1);
    assert_eq!(h.manager.state(), AuthState::Unauthenticated);
    assert!(h.manager.current_identity().is_none());
}

#[tokio::test]
async fn test_concurrent_unauthorized_navigate_once() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/balance"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&h.server)
        .await;

    let calls = (0..8).map(|_| h.client.get::<Value>("/api/balance"));
    let results = futures_util::future::join_all(calls).await;

    assert!(results.iter().all(|result| result.is_err()));
    assert_eq!(h.navigator.count(), 1);
    assert!(h.manager.current_identity().is_none());
}

#[tokio::test]
async fn test_concurrent_unsigned_unauthorized_navigate_once() {
    let h = harness(true).await;
    assert_ok!(h.manager.logout().await);
    Mock::given(method("GET"))
        .and(path("/api/balance"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&h.server)
        .await;

    let calls = (0..8).map(|_| h.client.get::<Value>("/api/balance"));
    let results = futures_util::future::join_all(calls).await;

    assert!(results.iter().all(|result| result.is_err()));
    let requests = h.server.received_requests().await.unwrap();
    assert!(requests.iter().all(|request| authorization(request).is_none()));
    assert_eq!(h.navigator.count(), 1);
}

#[tokio::test]
async fn test_stale_unauthorized_after_relogin_is_ignored() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/balance"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&h.server)
        .await;

    let authenticator = h.client.authenticator().unwrap().clone();
    let generation = h.manager.generation();
    let other = Keys::generate();
    assert_ok!(
        h.manager
            .login(LoginParams::LocalKey {
                secret: other.secret_key_hex(),
            })
            .await
    );

    // rejection for a request signed under the previous identity
    assert!(!authenticator.handle_rejection(Some(generation)));
    assert_eq!(h.navigator.count(), 0);
    assert_eq!(
        h.manager.current_identity().map(|identity| identity.public_key),
        Some(other.public_key())
    );
}

#[rstest]
#[case(400, false)]
#[case(403, false)]
#[case(500, false)]
#[tokio::test]
async fn test_error_status_mapping(#[case] status: u16, #[case] retryable: bool) {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/mints"))
        .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
        .mount(&h.server)
        .await;

    let err = h.client.get::<Value>("/api/mints").await.unwrap_err();
    match &err {
        GatewayError::Api { code, message } => {
            assert_eq!(*code, i32::from(status));
            assert_eq!(message, "nope");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.is_auth_error());
    assert_eq!(err.is_retryable(), retryable);
    // only 401 clears the identity
    assert!(h.manager.current_identity().is_some());
    assert_eq!(h.navigator.count(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let h = harness(true).await;
    Mock::given(method("GET"))
        .and(path("/api/mints"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&h.server)
        .await;

    let err = h.client.get::<Value>("/api/mints").await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidResponse(_)));
}

#[test]
fn test_client_with_custom_config() {
    let config = ClientConfig {
        content_type: "application/nostr+json".into(),
        ..ClientConfig::default()
    };
    let client = assert_ok!(GatewayClient::with_config_and_base_url(
        config,
        "https://gateway.example"
    ));
    assert_eq!(client.base_url().as_str(), "https://gateway.example/");
    assert!(client.authenticator().is_none());
}
