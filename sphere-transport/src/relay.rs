//! The relay pool.
//!
//! One task per relay url, each holding a durable connection: a live
//! subscription for the pool's current filters, publish fan-out, one-shot
//! queries, keepalive pings, and reconnect with bounded exponential backoff.
//! Subscriptions are re-issued on every reconnect.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sphere_common::backoff;
use sphere_tokio::{notify_once::NotifyOnce, task::SpTask};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::{
    event::{EventId, Filter, WireEvent},
    hub::MemRelayHub,
    TransportError,
};

/// Default timeout for query operations.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const LIVE_SUB_ID: &str = "live";

/// How a pool reaches its relays. One closed variant per implementation.
#[derive(Clone)]
pub enum RelayConnector {
    /// Real websocket connections.
    Ws,
    /// A shared in-process hub; every "relay" is the same hub.
    Mem(MemRelayHub),
}

enum RelayCmd {
    Publish(WireEvent),
    Resubscribe(Vec<Filter>),
    Query {
        filters: Vec<Filter>,
        reply_tx: oneshot::Sender<Vec<WireEvent>>,
    },
}

struct RelayHandle {
    cmd_tx: mpsc::UnboundedSender<RelayCmd>,
    task: SpTask<()>,
}

pub struct RelayPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: RelayConnector,
    relays: Mutex<HashMap<String, RelayHandle>>,
    inbound_tx: mpsc::Sender<WireEvent>,
    filters: std::sync::Mutex<Vec<Filter>>,
    shutdown: NotifyOnce,
}

impl RelayPool {
    /// Create a pool. Inbound events from every relay's live subscription
    /// arrive on the returned receiver.
    pub fn new(connector: RelayConnector) -> (Self, mpsc::Receiver<WireEvent>) {
        let (inbound_tx, inbound_rx) =
            mpsc::channel(sphere_tokio::DEFAULT_CHANNEL_SIZE);
        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                relays: Mutex::new(HashMap::new()),
                inbound_tx,
                filters: std::sync::Mutex::new(Vec::new()),
                shutdown: NotifyOnce::new(),
            }),
        };
        (pool, inbound_rx)
    }

    /// Add a relay and start its connection task. A no-op if already present.
    pub async fn add_relay(&self, url: &str) {
        let mut relays = self.inner.relays.lock().await;
        if relays.contains_key(url) {
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let filters = self.inner.filters.lock().unwrap().clone();
        let task = match &self.inner.connector {
            RelayConnector::Ws => SpTask::spawn(
                format!("relay-ws-{url}"),
                run_ws_relay(
                    url.to_owned(),
                    cmd_rx,
                    self.inner.inbound_tx.clone(),
                    filters,
                    self.inner.shutdown.clone(),
                ),
            ),
            RelayConnector::Mem(hub) => SpTask::spawn(
                format!("relay-mem-{url}"),
                run_mem_relay(
                    hub.clone(),
                    cmd_rx,
                    self.inner.inbound_tx.clone(),
                    filters,
                    self.inner.shutdown.clone(),
                ),
            ),
        };
        relays.insert(url.to_owned(), RelayHandle { cmd_tx, task });
    }

    /// Remove a relay, stopping its connection task.
    pub async fn remove_relay(&self, url: &str) {
        if let Some(handle) = self.inner.relays.lock().await.remove(url) {
            handle.task.abort();
        }
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.inner.relays.lock().await.keys().cloned().collect()
    }

    pub async fn is_connected(&self) -> bool {
        !self.inner.relays.lock().await.is_empty()
    }

    /// Replace the live subscription filters on every relay.
    pub async fn set_filters(&self, filters: Vec<Filter>) {
        *self.inner.filters.lock().unwrap() = filters.clone();
        for handle in self.inner.relays.lock().await.values() {
            let _ = handle.cmd_tx.send(RelayCmd::Resubscribe(filters.clone()));
        }
    }

    /// Publish an event to every relay.
    pub async fn publish(&self, event: WireEvent) -> Result<(), TransportError> {
        let relays = self.inner.relays.lock().await;
        if relays.is_empty() {
            return Err(TransportError::NotConnected);
        }
        for handle in relays.values() {
            let _ = handle.cmd_tx.send(RelayCmd::Publish(event.clone()));
        }
        Ok(())
    }

    /// Query every relay for stored events, merging and deduplicating the
    /// responses. Relays that don't answer within `timeout` are skipped.
    pub async fn query(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Result<Vec<WireEvent>, TransportError> {
        let reply_rxs = {
            let relays = self.inner.relays.lock().await;
            if relays.is_empty() {
                return Err(TransportError::NotConnected);
            }
            relays
                .values()
                .map(|handle| {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let _ = handle.cmd_tx.send(RelayCmd::Query {
                        filters: filters.clone(),
                        reply_tx,
                    });
                    reply_rx
                })
                .collect::<Vec<_>>()
        };

        let mut merged = Vec::new();
        let mut seen = std::collections::HashSet::<EventId>::new();
        for reply_rx in reply_rxs {
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(events)) =>
                    for event in events {
                        if seen.insert(event.id) {
                            merged.push(event);
                        }
                    },
                // Relay task gone or slow; other relays may still answer.
                Ok(Err(_)) | Err(_) => (),
            }
        }
        Ok(merged)
    }

    /// Stop every relay task and release the connections.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send();
        let mut relays = self.inner.relays.lock().await;
        for (_url, handle) in relays.drain() {
            handle.task.join_and_log().await;
        }
    }
}

// --- In-memory relay task --- //

async fn run_mem_relay(
    hub: MemRelayHub,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCmd>,
    inbound_tx: mpsc::Sender<WireEvent>,
    mut filters: Vec<Filter>,
    shutdown: NotifyOnce,
) {
    let mut live_rx = hub.subscribe();
    loop {
        tokio::select! {
            () = shutdown.recv() => break,
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(RelayCmd::Publish(event)) => hub.publish(event),
                Some(RelayCmd::Resubscribe(new_filters)) => filters = new_filters,
                Some(RelayCmd::Query { filters, reply_tx }) => {
                    let _ = reply_tx.send(hub.query(&filters));
                }
            },
            result = live_rx.recv() => match result {
                Ok(event) =>
                    if filters.iter().any(|f| f.matches(&event)) {
                        let _ = inbound_tx.send(event).await;
                    },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("mem relay lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

// --- Websocket relay task --- //

enum SessionEnd {
    Shutdown,
    CommandsClosed,
    Disconnected,
}

async fn run_ws_relay(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCmd>,
    inbound_tx: mpsc::Sender<WireEvent>,
    mut filters: Vec<Filter>,
    shutdown: NotifyOnce,
) {
    let mut backoff_iter = backoff::iter();
    loop {
        if shutdown.try_recv() {
            break;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!("Connected to relay: {url}");
                // A fresh session resets the backoff schedule.
                backoff_iter = backoff::iter();
                let end = drive_ws_session(
                    &url,
                    ws,
                    &mut cmd_rx,
                    &inbound_tx,
                    &mut filters,
                    &shutdown,
                )
                .await;
                match end {
                    SessionEnd::Shutdown | SessionEnd::CommandsClosed => break,
                    SessionEnd::Disconnected =>
                        warn!("Relay disconnected: {url}; reconnecting"),
                }
            }
            Err(err) => warn!("Relay connect failed: {url}: {err:#}"),
        }

        let wait = backoff_iter.next().expect("backoff iterator is infinite");
        tokio::select! {
            () = shutdown.recv() => break,
            () = tokio::time::sleep(wait) => (),
        }
    }
    debug!("Relay task exiting: {url}");
}

async fn drive_ws_session(
    url: &str,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cmd_rx: &mut mpsc::UnboundedReceiver<RelayCmd>,
    inbound_tx: &mpsc::Sender<WireEvent>,
    filters: &mut Vec<Filter>,
    shutdown: &NotifyOnce,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    // (Re-)issue the live subscription.
    if !filters.is_empty()
        && sink
            .send(WsMessage::Text(encode_req(LIVE_SUB_ID, filters)))
            .await
            .is_err()
    {
        return SessionEnd::Disconnected;
    }

    let mut pending_queries =
        HashMap::<String, (oneshot::Sender<Vec<WireEvent>>, Vec<WireEvent>)>::new();
    let mut next_query_id = 0u64;
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.recv() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                None => return SessionEnd::CommandsClosed,
                Some(RelayCmd::Publish(event)) => {
                    if sink.send(WsMessage::Text(encode_event(&event))).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(RelayCmd::Resubscribe(new_filters)) => {
                    *filters = new_filters;
                    let close = WsMessage::Text(encode_close(LIVE_SUB_ID));
                    let req = WsMessage::Text(encode_req(LIVE_SUB_ID, filters));
                    if sink.send(close).await.is_err()
                        || sink.send(req).await.is_err()
                    {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(RelayCmd::Query { filters: query_filters, reply_tx }) => {
                    let sub_id = format!("q{next_query_id}");
                    next_query_id += 1;
                    let req = WsMessage::Text(encode_req(&sub_id, &query_filters));
                    if sink.send(req).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    pending_queries.insert(sub_id, (reply_tx, Vec::new()));
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match parse_relay_frame(&text) {
                    Some(RelayFrame::Event { sub_id, event }) => {
                        if event.verify().is_err() {
                            warn!("Dropping invalid event from {url}");
                        } else if sub_id == LIVE_SUB_ID {
                            let _ = inbound_tx.send(event).await;
                        } else if let Some((_tx, acc)) =
                            pending_queries.get_mut(&sub_id)
                        {
                            acc.push(event);
                        }
                    }
                    Some(RelayFrame::Eose { sub_id }) => {
                        if let Some((reply_tx, events)) =
                            pending_queries.remove(&sub_id)
                        {
                            let _ = reply_tx.send(events);
                            let close = WsMessage::Text(encode_close(&sub_id));
                            if sink.send(close).await.is_err() {
                                return SessionEnd::Disconnected;
                            }
                        }
                    }
                    Some(RelayFrame::Notice(notice)) =>
                        debug!("Relay notice from {url}: {notice}"),
                    None => debug!("Unrecognized frame from {url}"),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    if sink.send(WsMessage::Pong(payload)).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Disconnected,
                Some(Ok(_)) => (),
                Some(Err(err)) => {
                    warn!("Relay stream error from {url}: {err:#}");
                    return SessionEnd::Disconnected;
                }
            },
        }
    }
}

// --- Wire frames --- //

enum RelayFrame {
    Event { sub_id: String, event: WireEvent },
    Eose { sub_id: String },
    Notice(String),
}

fn encode_event(event: &WireEvent) -> String {
    json!(["EVENT", event]).to_string()
}

fn encode_req(sub_id: &str, filters: &[Filter]) -> String {
    let mut frame = vec![json!("REQ"), json!(sub_id)];
    frame.extend(filters.iter().map(|f| json!(f)));
    Value::Array(frame).to_string()
}

fn encode_close(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

fn parse_relay_frame(text: &str) -> Option<RelayFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let array = value.as_array()?;
    match array.first()?.as_str()? {
        "EVENT" => {
            let sub_id = array.get(1)?.as_str()?.to_owned();
            let event = serde_json::from_value(array.get(2)?.clone()).ok()?;
            Some(RelayFrame::Event { sub_id, event })
        }
        "EOSE" => Some(RelayFrame::Eose {
            sub_id: array.get(1)?.as_str()?.to_owned(),
        }),
        "NOTICE" => Some(RelayFrame::Notice(
            array.get(1)?.as_str().unwrap_or_default().to_owned(),
        )),
        _ => None,
    }
}
