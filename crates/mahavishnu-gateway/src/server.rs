//! The gateway's HTTP entry point: a single WebSocket upgrade route
//! backed by shared, `Arc`-wrapped handles onto the core components it
//! exposes (§2: "C3, C5, C6, C7").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use mahavishnu_core::{Config, DeadLetterQueue, DependencyManager, EventBus, PoolRegistry, TaskOrderingEngine};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::session;

/// Shared state handed to every session: `Arc` handles onto the pieces
/// of the core this gateway fronts.
pub struct GatewayState {
    pub manager: Arc<DependencyManager>,
    pub dlq: Arc<DeadLetterQueue>,
    pub registry: Arc<PoolRegistry>,
    pub bus: Arc<EventBus>,
    pub ordering: Arc<TaskOrderingEngine>,
    pub ping_interval: Duration,
    pub delivery_queue_size: usize,
    /// Fired once when the server is asked to shut down; every live
    /// session sends its one goodbye frame and closes in response (§4.8).
    shutdown: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(
        manager: Arc<DependencyManager>,
        dlq: Arc<DeadLetterQueue>,
        registry: Arc<PoolRegistry>,
        bus: Arc<EventBus>,
        ordering: Arc<TaskOrderingEngine>,
        config: &Config,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            manager,
            dlq,
            registry,
            bus,
            ordering,
            ping_interval: Duration::from_secs(config.subscription.ping_interval_seconds),
            delivery_queue_size: config.subscription.delivery_queue_size,
            shutdown,
        })
    }
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let shutdown_rx = state.shutdown.subscribe();
    ws.on_upgrade(move |socket| session::run(socket, state, shutdown_rx))
}

/// Bind and serve the gateway until a Ctrl-C signal arrives. On shutdown,
/// every live session is told to send its goodbye frame and flush pending
/// replies before axum's graceful shutdown waits for connections to close.
pub async fn run_gateway(state: Arc<GatewayState>, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!(%addr, "mahavishnu gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    tracing::info!("mahavishnu gateway shut down");
    Ok(())
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    let _ = state.shutdown.send(());
}
