//! Per-connection session: the subscription state machine, request
//! dispatch, and ping/pong liveness probe described in §4.8.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use mahavishnu_core::RegistryError;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{Frame, parse_channel};
use crate::server::GatewayState;

/// Every client request carries an implicit timeout enforced by the
/// gateway (§5); on expiry the server returns an `error` frame.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One missed pong beyond 2x the ping interval terminates the session (§4.8).
const PONG_MISS_LIMIT: u32 = 2;

/// Bound on how long shutdown waits to flush a reply already in flight
/// before sending the goodbye frame and closing (§4.8).
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("{request} must name at least one channel")]
    EmptyChannelList { request: &'static str },

    #[error("invalid payload for {request}: {detail}")]
    InvalidPayload { request: &'static str, detail: String },

    #[error("unknown request event: {0}")]
    UnknownEvent(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            GatewayError::EmptyChannelList { .. } => "validation",
            GatewayError::InvalidPayload { .. } => "protocol",
            GatewayError::UnknownEvent(_) => "protocol",
            GatewayError::Registry(RegistryError::PoolNotFound { .. })
            | GatewayError::Registry(RegistryError::WorkerNotFound { .. }) => "not_found",
            GatewayError::Registry(RegistryError::DuplicatePool { .. })
            | GatewayError::Registry(RegistryError::DuplicateWorker { .. }) => "duplicate_resource",
            GatewayError::Registry(RegistryError::PoolNotAcceptingWorkers { .. }) => "validation",
        }
    }
}

struct ChannelSubscription {
    forwarder: JoinHandle<()>,
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Drive one client's WebSocket connection until it disconnects, a
/// protocol violation repeats, the liveness probe fails, or the server
/// is asked to shut down.
pub async fn run(socket: WebSocket, state: Arc<GatewayState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let (mut sink, mut stream) = socket.split();

    if send(&mut sink, Frame::welcome()).await.is_err() {
        return;
    }

    let mut subscriptions: HashMap<String, ChannelSubscription> = HashMap::new();
    let (event_tx, mut event_rx) = mpsc::channel::<Frame>(state.delivery_queue_size);
    let mut ping_tick = tokio::time::interval(state.ping_interval);
    ping_tick.tick().await; // first tick fires immediately; skip it
    let mut awaiting_pong = false;
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(Frame::Request { event, data, id }) => {
                                let frame = tokio::time::timeout(
                                    REQUEST_TIMEOUT,
                                    dispatch(&state, &mut subscriptions, &event_tx, &event, data, &id),
                                )
                                .await
                                .unwrap_or_else(|_| {
                                    Frame::error(Some(id.clone()), "timeout", "request timed out")
                                });
                                if send(&mut sink, frame).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Frame::Pong { .. }) => {
                                awaiting_pong = false;
                                missed_pongs = 0;
                            }
                            Ok(_) => {
                                if send(&mut sink, Frame::error(None, "protocol", "unexpected frame type")).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                if send(&mut sink, Frame::error(None, "protocol", format!("malformed frame: {err}"))).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read error, closing session");
                        break;
                    }
                }
            }
            Some(frame) = event_rx.recv() => {
                if send(&mut sink, frame).await.is_err() {
                    break;
                }
            }
            _ = ping_tick.tick() => {
                if awaiting_pong {
                    missed_pongs += 1;
                    if missed_pongs >= PONG_MISS_LIMIT {
                        warn!("client missed {missed_pongs} consecutive pongs, closing session");
                        break;
                    }
                }
                awaiting_pong = true;
                if send(&mut sink, Frame::ping()).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                // Drain any reply already queued before we say goodbye, up
                // to a bounded timeout, so an in-flight request doesn't get
                // silently dropped by the shutdown.
                let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, async {
                    while let Ok(frame) = event_rx.try_recv() {
                        if send(&mut sink, frame).await.is_err() {
                            break;
                        }
                    }
                })
                .await;
                let _ = send(&mut sink, Frame::goodbye()).await;
                break;
            }
        }
    }

    subscriptions.clear();
}

async fn send(sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin), frame: Frame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(&frame).expect("frame serialization is infallible");
    sink.send(Message::Text(text.into())).await
}

async fn dispatch(
    state: &Arc<GatewayState>,
    subscriptions: &mut HashMap<String, ChannelSubscription>,
    event_tx: &mpsc::Sender<Frame>,
    event: &str,
    data: Value,
    id: &str,
) -> Frame {
    match run_request(state, subscriptions, event_tx, event, data, id).await {
        Ok(frame) => frame,
        Err(err) => Frame::error(Some(id.to_string()), err.code(), err.to_string()),
    }
}

async fn run_request(
    state: &Arc<GatewayState>,
    subscriptions: &mut HashMap<String, ChannelSubscription>,
    event_tx: &mpsc::Sender<Frame>,
    event: &str,
    data: Value,
    id: &str,
) -> Result<Frame, GatewayError> {
    match event {
        "subscribe" => {
            let channels = channel_list(&data, "subscribe")?;
            for wire in &channels {
                if subscriptions.contains_key(wire) {
                    continue;
                }
                let subscription = state.bus.subscribe(parse_channel(wire));
                let tx = event_tx.clone();
                let forwarder = tokio::spawn(async move {
                    loop {
                        let event = subscription.recv().await;
                        if tx.send(Frame::from(event)).await.is_err() {
                            break;
                        }
                    }
                });
                subscriptions.insert(wire.clone(), ChannelSubscription { forwarder });
            }
            Ok(Frame::subscribed(id, channels.join(",")))
        }
        "unsubscribe" => {
            let channels = channel_list(&data, "unsubscribe")?;
            for wire in &channels {
                subscriptions.remove(wire);
            }
            Ok(Frame::unsubscribed(id, channels.join(",")))
        }
        "get_pool_status" => {
            let pool_id = string_field(&data, "pool_id", "get_pool_status")?;
            let snapshot = state.registry.pool_status(&pool_id)?;
            let worker_counts: serde_json::Map<String, Value> = snapshot
                .worker_counts
                .iter()
                .map(|(status, count)| (status.to_string(), Value::from(*count)))
                .collect();
            Ok(Frame::response(
                id,
                serde_json::json!({
                    "pool_id": snapshot.pool.pool_id,
                    "pool_type": snapshot.pool.pool_type,
                    "state": snapshot.pool.state.to_string(),
                    "worker_count": snapshot.pool.worker_count,
                    "min_workers": snapshot.pool.min_workers,
                    "max_workers": snapshot.pool.max_workers,
                    "completed_tasks": snapshot.pool.completed_tasks,
                    "average_duration_secs": snapshot.pool.average_duration_secs,
                    "worker_counts": worker_counts,
                }),
            ))
        }
        "get_worker_status" => {
            let pool_id = string_field(&data, "pool_id", "get_worker_status")?;
            let worker_id = string_field(&data, "worker_id", "get_worker_status")?;
            let worker = state.registry.worker_status(&pool_id, &worker_id).ok_or_else(|| {
                GatewayError::Registry(RegistryError::WorkerNotFound {
                    pool_id: pool_id.clone(),
                    worker_id: worker_id.clone(),
                })
            })?;
            Ok(Frame::response(
                id,
                serde_json::json!({
                    "worker_id": worker.worker_id,
                    "pool_id": worker.pool_id,
                    "status": worker.status.to_string(),
                    "current_task_id": worker.current_task_id.map(|id| id.to_string()),
                    "tasks_completed": worker.tasks_completed,
                    "last_transition_at": worker.last_transition_at,
                }),
            ))
        }
        other => Err(GatewayError::UnknownEvent(other.to_string())),
    }
}

fn channel_list(data: &Value, request: &'static str) -> Result<Vec<String>, GatewayError> {
    let channels: Vec<String> = data
        .get("channels")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e: serde_json::Error| GatewayError::InvalidPayload {
            request,
            detail: e.to_string(),
        })?
        .unwrap_or_default();
    if channels.is_empty() {
        return Err(GatewayError::EmptyChannelList { request });
    }
    Ok(channels)
}

fn string_field(data: &Value, field: &'static str, request: &'static str) -> Result<String, GatewayError> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidPayload {
            request,
            detail: format!("missing or non-string field `{field}`"),
        })
}
