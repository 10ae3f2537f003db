/*
[INPUT]:  Relay websocket URLs, events to publish, subscription filters
[OUTPUT]: Relay acknowledgements, stored events and live subscription streams
[POS]:    Relay layer - NIP-01 websocket transport
[UPDATE]: When changing connection handling or relay message routing
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::message::{ClientMessage, Filter, RelayMessage};
use super::{RelaySubscription, RelayTransport, newest_first};
use crate::http::{GatewayError, Result};
use crate::types::{EventId, SignedEvent};

const OUTBOUND_BUFFER: usize = 100;
const SUBSCRIPTION_BUFFER: usize = 256;
const NOTICE_LOG_LIMIT: usize = 5;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const INVALID_EVENT_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static NOTICE_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static INVALID_EVENT_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Connection {
    url: Url,
    outbound: mpsc::Sender<WsMessage>,
}

#[derive(Debug)]
enum Route {
    Live(mpsc::Sender<SignedEvent>),
    Fetch {
        events: mpsc::Sender<SignedEvent>,
        eose: mpsc::Sender<()>,
    },
}

#[derive(Debug)]
struct Ack {
    relay: Url,
    accepted: bool,
    message: String,
}

#[derive(Debug, Default)]
struct Routing {
    routes: HashMap<String, Route>,
    live_filters: HashMap<String, Filter>,
    acks: HashMap<EventId, mpsc::Sender<Ack>>,
}

/// Websocket relay pool speaking NIP-01
#[derive(Debug)]
pub struct RelayClient {
    config: RelayConfig,
    connections: AsyncMutex<Vec<Connection>>,
    routing: Arc<Mutex<Routing>>,
}

impl RelayClient {
    /// Create a client with no connections yet
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            connections: AsyncMutex::new(Vec::new()),
            routing: Arc::new(Mutex::new(Routing::default())),
        }
    }

    /// Create a client and connect the given relays
    pub async fn connect(config: RelayConfig, relays: &[Url]) -> Result<Self> {
        let client = Self::new(config);
        client.add_relays(relays).await?;
        Ok(client)
    }

    pub async fn connected_relays(&self) -> Vec<Url> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|connection| connection.url.clone())
            .collect()
    }

    async fn open(&self, url: &Url) -> Result<Connection> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| GatewayError::Timeout {
                    duration: self.config.connect_timeout.as_secs(),
                })??;
        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
        let routing = self.routing.clone();
        let relay = url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Close(_))) => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                            Some(Ok(WsMessage::Text(text))) => {
                                route_frame(&routing, &relay, text.as_str()).await;
                            }
                            Some(Ok(WsMessage::Binary(bytes))) => {
                                if let Ok(text) = std::str::from_utf8(&bytes) {
                                    route_frame(&routing, &relay, text).await;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => {
                                break;
                            }
                        }
                    }
                }
            }
            info!(relay = %relay, "relay connection closed");
        });

        info!(relay = %url, "relay connected");
        Ok(Connection {
            url: url.clone(),
            outbound: outbound_tx,
        })
    }

    /// Send to every live connection, dropping the ones whose task has exited.
    async fn broadcast(&self, message: &ClientMessage) -> Result<usize> {
        let frame = message.to_json()?;
        let mut connections = self.connections.lock().await;
        let mut delivered = 0;
        let mut closed = Vec::new();
        for connection in connections.iter() {
            if connection
                .outbound
                .send(WsMessage::Text(frame.clone().into()))
                .await
                .is_ok()
            {
                delivered += 1;
            } else {
                closed.push(connection.url.clone());
            }
        }
        if !closed.is_empty() {
            connections.retain(|connection| !closed.contains(&connection.url));
            warn!(relays = ?closed, "dropped closed relay connections");
        }
        Ok(delivered)
    }

    fn routing(&self) -> MutexGuard<'_, Routing> {
        lock_routing(&self.routing)
    }

    async fn await_acks(&self, acks: &mut mpsc::Receiver<Ack>, expected: usize) -> Result<()> {
        let deadline = Instant::now() + self.config.publish_timeout;
        let mut rejections = Vec::new();
        for _ in 0..expected {
            match tokio::time::timeout_at(deadline, acks.recv()).await {
                Ok(Some(ack)) if ack.accepted => return Ok(()),
                Ok(Some(ack)) => rejections.push(format!("{}: {}", ack.relay, ack.message)),
                Ok(None) => break,
                Err(_) => {
                    return Err(GatewayError::NetworkOrRelay(format!(
                        "no relay accepted the event within {}s",
                        self.config.publish_timeout.as_secs()
                    )));
                }
            }
        }
        Err(GatewayError::NetworkOrRelay(format!(
            "event rejected: {}",
            rejections.join("; ")
        )))
    }
}

fn lock_routing(routing: &Mutex<Routing>) -> MutexGuard<'_, Routing> {
    match routing.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn route_frame(routing: &Mutex<Routing>, relay: &Url, raw: &str) {
    let message = match RelayMessage::from_json(raw) {
        Ok(message) => message,
        Err(err) => {
            log_parse_fail_once(&err, raw);
            return;
        }
    };

    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if let Err(err) = event.verify() {
                log_invalid_event_once(relay, &err);
                return;
            }
            let sender = match lock_routing(routing).routes.get(&subscription_id) {
                Some(Route::Live(sender)) => sender.clone(),
                Some(Route::Fetch { events, .. }) => events.clone(),
                None => return,
            };
            if sender.send(*event).await.is_err() {
                debug!(subscription = %subscription_id, "subscription receiver dropped");
            }
        }
        RelayMessage::EndOfStoredEvents(subscription_id)
        | RelayMessage::Closed {
            subscription_id, ..
        } => {
            let eose = match lock_routing(routing).routes.get(&subscription_id) {
                Some(Route::Fetch { eose, .. }) => Some(eose.clone()),
                _ => None,
            };
            if let Some(eose) = eose {
                let _ = eose.send(()).await;
            }
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            let sender = lock_routing(routing).acks.get(&event_id).cloned();
            if let Some(sender) = sender {
                let _ = sender
                    .send(Ack {
                        relay: relay.clone(),
                        accepted,
                        message,
                    })
                    .await;
            }
        }
        RelayMessage::Notice(notice) => log_notice_once(relay, &notice),
        RelayMessage::Auth(_) => {
            debug!(relay = %relay, "relay requested auth, ignoring");
        }
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn publish(&self, event: &SignedEvent) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.routing().acks.insert(event.id, tx);

        let result = match self.broadcast(&ClientMessage::Event(event.clone())).await {
            Ok(0) => Err(GatewayError::NetworkOrRelay("no relay connected".into())),
            Ok(sent) => self.await_acks(&mut rx, sent).await,
            Err(err) => Err(err),
        };

        self.routing().acks.remove(&event.id);
        if result.is_ok() {
            debug!(event_id = %event.id, kind = %event.kind, "event published");
        }
        result
    }

    async fn fetch(&self, filter: Filter, timeout: Duration) -> Result<Vec<SignedEvent>> {
        let subscription_id = Uuid::new_v4().simple().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (eose_tx, mut eose_rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.routing().routes.insert(
            subscription_id.clone(),
            Route::Fetch {
                events: events_tx,
                eose: eose_tx,
            },
        );

        let request = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters: vec![filter.clone()],
        };
        let expected = match self.broadcast(&request).await {
            Ok(0) => {
                self.routing().routes.remove(&subscription_id);
                return Err(GatewayError::NetworkOrRelay("no relay connected".into()));
            }
            Ok(sent) => sent,
            Err(err) => {
                self.routing().routes.remove(&subscription_id);
                return Err(err);
            }
        };

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut finished = 0;
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => collected.push(event),
                Some(()) = eose_rx.recv() => {
                    finished += 1;
                    if finished >= expected {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(
                        subscription = %subscription_id,
                        finished,
                        expected,
                        "fetch deadline reached, returning partial results"
                    );
                    break;
                }
            }
        }

        self.routing().routes.remove(&subscription_id);
        while let Ok(event) = events_rx.try_recv() {
            collected.push(event);
        }
        let _ = self.broadcast(&ClientMessage::Close(subscription_id)).await;

        collected.retain(|event| filter.matches(event));
        Ok(newest_first(collected, filter.limit))
    }

    async fn subscribe(&self, filter: Filter) -> Result<RelaySubscription> {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        {
            let mut routing = self.routing();
            routing.routes.insert(id.clone(), Route::Live(tx));
            routing.live_filters.insert(id.clone(), filter.clone());
        }
        let request = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: vec![filter],
        };
        if let Err(err) = self.broadcast(&request).await {
            let mut routing = self.routing();
            routing.routes.remove(&id);
            routing.live_filters.remove(&id);
            return Err(err);
        }
        Ok(RelaySubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        {
            let mut routing = self.routing();
            routing.routes.remove(subscription_id);
            routing.live_filters.remove(subscription_id);
        }
        self.broadcast(&ClientMessage::Close(subscription_id.to_string()))
            .await?;
        Ok(())
    }

    async fn add_relays(&self, relays: &[Url]) -> Result<()> {
        let known = self.connected_relays().await;
        let mut opened = Vec::new();
        for url in relays.iter().filter(|url| !known.contains(url)) {
            match self.open(url).await {
                Ok(connection) => opened.push(connection),
                Err(err) => warn!(relay = %url, error = %err, "relay connection failed"),
            }
        }

        // replay live subscriptions on the new sockets
        let replay: Vec<ClientMessage> = self
            .routing()
            .live_filters
            .iter()
            .map(|(id, filter)| ClientMessage::Req {
                subscription_id: id.clone(),
                filters: vec![filter.clone()],
            })
            .collect();
        for connection in &opened {
            for request in &replay {
                let _ = connection
                    .outbound
                    .send(WsMessage::Text(request.to_json()?.into()))
                    .await;
            }
        }

        let mut connections = self.connections.lock().await;
        connections.extend(opened);
        if connections.is_empty() && !relays.is_empty() {
            return Err(GatewayError::NetworkOrRelay(
                "could not connect to any relay".into(),
            ));
        }
        Ok(())
    }
}

fn log_notice_once(relay: &Url, notice: &str) {
    let count = NOTICE_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < NOTICE_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = NOTICE_LOG_LIMIT,
            relay = %relay,
            notice = %truncate_for_log(notice, RAW_LOG_MAX_BYTES),
            "relay notice"
        );
    }
}

fn log_invalid_event_once(relay: &Url, err: &GatewayError) {
    let count = INVALID_EVENT_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < INVALID_EVENT_LOG_LIMIT {
        warn!(
            sample_index = count + 1,
            sample_limit = INVALID_EVENT_LOG_LIMIT,
            relay = %relay,
            error = %err,
            "relay delivered an event that does not verify"
        );
    }
}

fn log_parse_fail_once(err: &GatewayError, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "relay frame parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            message = %preview,
            "relay frame parse failed"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
