//! WebSocket JSON-RPC engine for Substrate nodes
//!
//! One connection carries every request. Responses are routed back to their
//! caller by request id, and `author_extrinsicUpdate` notifications are routed
//! to the subscription they belong to.

use super::{ExtrinsicStatus, RpcEngine, StatusSubscription};
use crate::config::NodeConfig;
use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::tx::{ExtrinsicHash, FeeInfo};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc as status_channel;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type StatusSender = status_channel::UnboundedSender<ExtrinsicResult<ExtrinsicStatus>>;
type StatusReceiver = status_channel::UnboundedReceiver<ExtrinsicResult<ExtrinsicStatus>>;

const METHOD_QUERY_INFO: &str = "payment_queryInfo";
const METHOD_SUBMIT: &str = "author_submitExtrinsic";
const METHOD_SUBMIT_AND_WATCH: &str = "author_submitAndWatchExtrinsic";
const METHOD_UNWATCH: &str = "author_unwatchExtrinsic";
const NOTIFICATION_EXTRINSIC_UPDATE: &str = "author_extrinsicUpdate";

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<RpcErrorObject> for ExtrinsicError {
    fn from(err: RpcErrorObject) -> Self {
        let message = match err.data {
            Some(Value::String(data)) => format!("{}: {}", err.message, data),
            Some(data) if !data.is_null() => format!("{}: {}", err.message, data),
            _ => err.message,
        };
        ExtrinsicError::NodeRejection {
            code: Some(err.code),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: Value,
    result: Value,
}

/// Any frame the node may send: a response (has `id`) or a notification
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

/// Subscriptions that may hold parked notifications at once
const MAX_PARKED_SUBSCRIPTIONS: usize = 256;

/// Parked notifications kept per subscription
const MAX_PARKED_PER_SUBSCRIPTION: usize = 32;

/// Subscription routing table.
///
/// Notifications can arrive before the subscribe response has been handed
/// back to the caller; those are parked until the route is registered.
/// Parking only happens while a subscribe request is outstanding, and the
/// parked set is emptied once none is.
#[derive(Default)]
struct SubscriptionRoutes {
    senders: HashMap<String, StatusSender>,
    parked: HashMap<String, Vec<Value>>,
    /// `submit_and_watch` requests still waiting for their subscription id
    watches_in_flight: usize,
}

impl SubscriptionRoutes {
    fn begin_watch(&mut self) {
        self.watches_in_flight += 1;
    }

    fn end_watch(&mut self) {
        self.watches_in_flight = self.watches_in_flight.saturating_sub(1);
        if self.watches_in_flight == 0 && !self.parked.is_empty() {
            debug!(
                "Dropping parked notifications of {} unclaimed subscriptions",
                self.parked.len()
            );
            self.parked.clear();
        }
    }

    fn register(&mut self, subscription_id: &str) -> StatusReceiver {
        let (tx, rx) = status_channel::unbounded();
        if let Some(parked) = self.parked.remove(subscription_id) {
            debug!(
                "Delivering {} early notifications for subscription {}",
                parked.len(),
                subscription_id
            );
            for result in parked {
                let _ = tx.unbounded_send(parse_status(result));
            }
        }
        self.senders.insert(subscription_id.to_string(), tx);
        rx
    }

    fn remove(&mut self, subscription_id: &str) {
        self.senders.remove(subscription_id);
        self.parked.remove(subscription_id);
    }

    fn route(&mut self, key: String, result: Value) {
        if let Some(tx) = self.senders.get(&key) {
            if tx.unbounded_send(parse_status(result)).is_err() {
                debug!("Receiver for subscription {} dropped", key);
                self.senders.remove(&key);
            }
            return;
        }

        if self.watches_in_flight == 0 {
            debug!("Dropping notification for closed subscription {}", key);
            return;
        }
        if !self.parked.contains_key(&key) && self.parked.len() >= MAX_PARKED_SUBSCRIPTIONS {
            warn!("Parked subscription limit reached, dropping notification for {}", key);
            return;
        }
        let parked = self.parked.entry(key).or_default();
        if parked.len() < MAX_PARKED_PER_SUBSCRIPTION {
            parked.push(result);
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, tx) in self.senders.drain() {
            let _ = tx.unbounded_send(Err(ExtrinsicError::Transport(reason.to_string())));
        }
        self.parked.clear();
    }
}

/// Marks a subscribe request as outstanding until dropped
struct PendingWatch<'a> {
    inner: &'a EngineInner,
}

impl<'a> PendingWatch<'a> {
    fn begin(inner: &'a EngineInner) -> Self {
        lock_routes(inner).begin_watch();
        Self { inner }
    }
}

impl Drop for PendingWatch<'_> {
    fn drop(&mut self) {
        lock_routes(self.inner).end_watch();
    }
}

struct EngineInner {
    sink: AsyncMutex<SplitSink<WsStream, Message>>,
    pending: DashMap<u64, oneshot::Sender<ExtrinsicResult<Value>>>,
    routes: Mutex<SubscriptionRoutes>,
    next_id: AtomicU64,
}

/// JSON-RPC engine over a single WebSocket connection
pub struct WsRpcEngine {
    inner: Arc<EngineInner>,
    reader_handle: JoinHandle<()>,
    request_timeout: Duration,
}

impl WsRpcEngine {
    /// Connect to the node described by `config`
    pub async fn connect(config: &NodeConfig) -> ExtrinsicResult<Self> {
        let (stream, _response) = connect_async(config.url.as_str())
            .await
            .map_err(|e| ExtrinsicError::Transport(format!("failed to connect to {}: {}", config.url, e)))?;

        info!("WebSocket connected to {}", config.url);

        let (sink, reader) = stream.split();
        let inner = Arc::new(EngineInner {
            sink: AsyncMutex::new(sink),
            pending: DashMap::new(),
            routes: Mutex::new(SubscriptionRoutes::default()),
            next_id: AtomicU64::new(1),
        });

        let reader_handle = tokio::spawn(reader_loop(reader, inner.clone()));

        Ok(Self {
            inner,
            reader_handle,
            request_timeout: config.request_timeout(),
        })
    }

    /// Issue a request and wait for its response
    async fn request(&self, method: &str, params: Value) -> ExtrinsicResult<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RPC request {} -> {}", id, method);
        let sent = self
            .inner
            .sink
            .lock()
            .await
            .send(Message::Text(payload.to_string()))
            .await;
        if let Err(e) = sent {
            self.inner.pending.remove(&id);
            return Err(ExtrinsicError::Transport(format!("failed to send {}: {}", method, e)));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExtrinsicError::Transport(format!(
                "connection closed before {} response",
                method
            ))),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(ExtrinsicError::Timeout {
                    operation: format!("{} response", method),
                })
            }
        }
    }
}

impl Drop for WsRpcEngine {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

#[async_trait]
impl RpcEngine for WsRpcEngine {
    async fn query_fee(&self, extrinsic_hex: &str) -> ExtrinsicResult<FeeInfo> {
        let result = self.request(METHOD_QUERY_INFO, json!([extrinsic_hex])).await?;
        serde_json::from_value(result)
            .map_err(|e| ExtrinsicError::Transport(format!("malformed fee info: {}", e)))
    }

    async fn submit(&self, extrinsic_hex: &str) -> ExtrinsicResult<ExtrinsicHash> {
        let result = self.request(METHOD_SUBMIT, json!([extrinsic_hex])).await?;
        match result {
            Value::String(hash) => Ok(ExtrinsicHash::new(hash)),
            other => Err(ExtrinsicError::Transport(format!(
                "unexpected submit response: {}",
                other
            ))),
        }
    }

    async fn submit_and_watch(&self, extrinsic_hex: &str) -> ExtrinsicResult<StatusSubscription> {
        let pending = PendingWatch::begin(&self.inner);
        let result = self
            .request(METHOD_SUBMIT_AND_WATCH, json!([extrinsic_hex]))
            .await?;
        let id = subscription_key(&result).ok_or_else(|| {
            ExtrinsicError::Transport(format!("unexpected subscription id: {}", result))
        })?;

        let events = lock_routes(&self.inner).register(&id);
        drop(pending);
        debug!("Watching extrinsic via subscription {}", id);

        Ok(StatusSubscription {
            id,
            events: events.boxed(),
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> ExtrinsicResult<()> {
        lock_routes(&self.inner).remove(subscription_id);

        self.request(METHOD_UNWATCH, json!([subscription_id])).await?;
        debug!("Unsubscribed {}", subscription_id);
        Ok(())
    }
}

fn lock_routes(inner: &EngineInner) -> std::sync::MutexGuard<'_, SubscriptionRoutes> {
    // Routing state stays consistent even if a holder panicked.
    inner.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscription ids are strings on current nodes and numbers on old ones
fn subscription_key(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn parse_status(result: Value) -> ExtrinsicResult<ExtrinsicStatus> {
    serde_json::from_value(result)
        .map_err(|e| ExtrinsicError::Transport(format!("malformed extrinsic status: {}", e)))
}

async fn reader_loop(mut reader: SplitStream<WsStream>, inner: Arc<EngineInner>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&inner, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&inner, text),
                Err(_) => warn!("Ignoring non-UTF8 binary frame"),
            },
            Ok(Message::Close(_)) => {
                info!("Node closed the WebSocket connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket read error: {}", e);
                break;
            }
        }
    }

    fail_all(&inner, "connection closed");
}

fn handle_frame(inner: &EngineInner, text: &str) {
    let message: IncomingMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed RPC frame: {}", e);
            return;
        }
    };

    if let Some(id) = message.id {
        let Some((_, tx)) = inner.pending.remove(&id) else {
            debug!("Response for unknown request {}", id);
            return;
        };
        let result = match message.error {
            Some(err) => Err(err.into()),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
        return;
    }

    match (message.method.as_deref(), message.params) {
        (Some(NOTIFICATION_EXTRINSIC_UPDATE), Some(params)) => {
            let Some(key) = subscription_key(&params.subscription) else {
                warn!("Notification without a usable subscription id");
                return;
            };
            lock_routes(inner).route(key, params.result);
        }
        (Some(method), _) => debug!("Ignoring notification {}", method),
        (None, _) => warn!("RPC frame with neither id nor method"),
    }
}

fn fail_all(inner: &EngineInner, reason: &str) {
    let ids: Vec<u64> = inner.pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = inner.pending.remove(&id) {
            let _ = tx.send(Err(ExtrinsicError::Transport(reason.to_string())));
        }
    }

    lock_routes(inner).fail_all(reason);
}
