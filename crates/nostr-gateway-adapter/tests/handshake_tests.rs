/*
[INPUT]:  Handshake scenarios against an in-process relay and remote signer
[OUTPUT]: Test results for nostrconnect pairing, bunker strings, timeouts and cancellation
[POS]:    Integration tests - remote signer handshake
[UPDATE]: When pairing channels change
*/

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{SignerService, TEST_RELAY, memory_relay};
use nostr_gateway_adapter::auth::{
    ConnectionRequest, HandshakeConfig, RpcResponse, handshake_triggers, seal_rpc,
};
use nostr_gateway_adapter::{
    GatewayError, Keys, Kind, MemoryRelay, NostrSigner, RelayTransport, RemoteSignerHandshake,
    UnsignedEvent,
};
use tokio_test::assert_ok;
use url::Url;

fn config(timeout: Duration) -> HandshakeConfig {
    HandshakeConfig {
        relays: vec![Url::parse(TEST_RELAY).unwrap()],
        app_name: "Gateway".into(),
        app_url: "https://app.example".into(),
        timeout,
        request_timeout: Duration::from_secs(2),
        ..HandshakeConfig::default()
    }
}

fn handshake(relay: &Arc<MemoryRelay>, timeout: Duration) -> RemoteSignerHandshake {
    assert_ok!(RemoteSignerHandshake::new(relay.clone(), config(timeout)))
}

#[tokio::test]
async fn test_relay_response_with_secret_completes() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_secs(5));
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    service.accept(&uri).await;
    let signer = assert_ok!(waiting.await.unwrap());

    assert_eq!(signer.remote_pubkey(), service.signer_keys.public_key());
    assert_eq!(assert_ok!(signer.get_public_key().await), service.user_keys.public_key());
    let signed = assert_ok!(signer.sign_event(UnsignedEvent::new(Kind::HTTP_AUTH, "")).await);
    assert_eq!(signed.pubkey, service.user_keys.public_key());

    // only the signer's own response subscription is left open
    signer.close().await;
    assert_eq!(relay.subscription_count(), 1);
}

#[tokio::test]
async fn test_signer_initiated_connect_is_acknowledged() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_secs(5));
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    service.connect_request(&uri).await;
    let signer = assert_ok!(waiting.await.unwrap());
    assert_eq!(signer.remote_pubkey(), service.signer_keys.public_key());

    let acks: Vec<_> = relay
        .events_of_kind(Kind::NOSTR_CONNECT)
        .into_iter()
        .filter(|event| event.pubkey == signer.client_pubkey())
        .filter(|event| event.tag_value("p") == Some(service.signer_keys.public_key().to_hex().as_str()))
        .collect();
    assert!(!acks.is_empty());
}

#[tokio::test]
async fn test_wrong_secret_is_ignored_until_timeout() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_millis(300));
    let mut forged = ConnectionRequest::parse(&handshake.uri()).unwrap();
    forged.secret = "not-the-secret".into();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    service.accept(&forged.to_uri()).await;
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
}

#[tokio::test]
async fn test_timeout_fires_within_tolerance() {
    let relay = memory_relay();
    let timeout = Duration::from_millis(250);
    let handshake = handshake(&relay, timeout);
    let (triggers, _controls) = handshake_triggers();

    let started = Instant::now();
    let err = handshake.wait(triggers).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
    assert!(elapsed >= timeout, "fired early after {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(500), "fired late after {elapsed:?}");
    // nothing installed, subscription closed
    assert_eq!(relay.subscription_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_wait() {
    let relay = memory_relay();
    let handshake = handshake(&relay, Duration::from_secs(5));
    let (triggers, controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    tokio::time::sleep(Duration::from_millis(20)).await;
    controls.cancel();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(relay.subscription_count(), 0);
}

#[tokio::test]
async fn test_manual_bunker_string_completes() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_secs(5));
    let (triggers, controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    // a malformed string is reported and the wait continues
    assert_ok!(controls.submit_bunker("bunker://nope").await);
    assert_ok!(controls.submit_bunker(service.bunker_uri(None)).await);
    let signer = assert_ok!(waiting.await.unwrap());

    assert_eq!(signer.remote_pubkey(), service.signer_keys.public_key());
    assert_eq!(assert_ok!(signer.get_public_key().await), service.user_keys.public_key());
}

#[tokio::test]
async fn test_response_published_before_wait_is_found() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_secs(5));
    let uri = handshake.uri();
    let (triggers, controls) = handshake_triggers();

    // the signer answered before the client started listening
    service.accept(&uri).await;
    controls.notify_focus();
    let signer = assert_ok!(handshake.wait(triggers).await);
    assert_eq!(signer.remote_pubkey(), service.signer_keys.public_key());
}

#[tokio::test]
async fn test_focus_alone_never_completes() {
    let relay = memory_relay();
    let handshake = handshake(&relay, Duration::from_millis(200));
    let (triggers, controls) = handshake_triggers();
    controls.notify_focus();
    controls.notify_focus();
    let err = handshake.wait(triggers).await.unwrap_err();
    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
}

#[tokio::test]
async fn test_signer_rejection_waits_for_deadline() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_millis(300));
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    service.reject(&uri, "user declined").await;
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
}

#[tokio::test]
async fn test_stranger_rejection_does_not_abort_pairing() {
    let relay = memory_relay();
    let service = SignerService::start(relay.clone()).await;
    let handshake = handshake(&relay, Duration::from_secs(5));
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    let request = ConnectionRequest::parse(&uri).unwrap();
    let stranger = Keys::generate();
    let rejection = RpcResponse {
        id: "stranger-1".into(),
        result: None,
        error: Some("nope".into()),
    };
    let event = seal_rpc(&stranger, &request.client_pubkey, &rejection).unwrap();
    relay.publish(&event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    service.accept(&uri).await;
    let signer = assert_ok!(waiting.await.unwrap());
    assert_eq!(signer.remote_pubkey(), service.signer_keys.public_key());
}

#[tokio::test]
async fn test_silent_signer_after_accept_is_bounded_by_deadline() {
    let relay = memory_relay();
    let timeout = Duration::from_millis(300);
    let handshake = handshake(&relay, timeout);
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    // accepts the pairing but never answers get_public_key
    let request = ConnectionRequest::parse(&uri).unwrap();
    let silent = Keys::generate();
    let accept = RpcResponse {
        id: "accept-1".into(),
        result: Some(request.secret.clone()),
        error: None,
    };

    let started = Instant::now();
    let waiting = tokio::spawn(handshake.wait(triggers));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let event = seal_rpc(&silent, &request.client_pubkey, &accept).unwrap();
    relay.publish(&event).await.unwrap();

    let err = waiting.await.unwrap().unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
    assert!(elapsed < timeout + Duration::from_millis(500), "outlived the deadline: {elapsed:?}");
}

#[tokio::test]
async fn test_stranger_events_do_not_complete() {
    let relay = memory_relay();
    let handshake = handshake(&relay, Duration::from_millis(300));
    let uri = handshake.uri();
    let (triggers, _controls) = handshake_triggers();

    let waiting = tokio::spawn(handshake.wait(triggers));
    // plaintext garbage p-tagged to the client cannot be decrypted
    let request = ConnectionRequest::parse(&uri).unwrap();
    let stranger = Keys::generate();
    let junk = stranger
        .sign_event(
            UnsignedEvent::new(Kind::NOSTR_CONNECT, "hello")
                .tag(["p", request.client_pubkey.to_hex().as_str()]),
        )
        .unwrap();
    relay.publish(&junk).await.unwrap();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
}
