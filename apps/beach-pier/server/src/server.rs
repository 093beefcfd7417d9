use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beach_pier_core::BufferPool;
use futures_util::StreamExt;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{signal, time::Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PierConfig, ServerConfig};
use crate::connection::{Connection, FlushOutcome, WsSink};
use crate::context::{ContextRegistry, ContextSnapshot};
use crate::heartbeat::spawn_heartbeat;
use crate::manager::ApplicationManager;

pub struct AppState {
    pub registry: ContextRegistry,
    pub pool: BufferPool,
    pub config: Arc<PierConfig>,
    pub manager: Arc<dyn ApplicationManager>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: PierConfig,
        manager: Arc<dyn ApplicationManager>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let pool = BufferPool::new(config.pool_size, config.buffer_capacity, config.acquire_timeout);
        let registry = ContextRegistry::new(config.idle_timeout, config.recycle_interval);
        Self {
            registry,
            pool,
            config: Arc::new(config),
            manager,
            metrics,
        }
    }

    fn stats(&self) -> StatsResponse {
        let contexts = self.registry.snapshot();
        StatsResponse {
            active_contexts: contexts.len(),
            bound_connections: contexts.iter().filter(|entry| entry.bound).count(),
            pool_size: self.pool.size(),
            pool_available: self.pool.available(),
            contexts,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_contexts: usize,
    bound_connections: usize,
    pool_size: usize,
    pool_available: usize,
    contexts: Vec<ContextSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    session_id: Option<Uuid>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn run(
    config: ServerConfig,
    manager: Arc<dyn ApplicationManager>,
    metrics: PrometheusHandle,
) -> Result<()> {
    let state = Arc::new(AppState::new(config.pier.clone(), manager, Some(metrics)));
    let recycler_handle = state.registry.spawn_recycler();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-pier listening on {}", config.listen_addr);

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    recycler_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let remote_addr = remote.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state, query.session_id, remote_addr, user_agent)
    })
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    requested: Option<Uuid>,
    remote_addr: Option<SocketAddr>,
    user_agent: String,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let connection_id = Uuid::new_v4();
    let (context, start_kind) = state.registry.resolve(requested);
    let session_id = context.session_id();
    let mut superseded = context.bind_connection(connection_id);

    let connection = Arc::new(Connection::new(
        connection_id,
        Arc::clone(&context),
        Arc::clone(&state.manager),
        state.pool.clone(),
        Arc::clone(&state.config),
        WsSink::new(ws_tx),
    ));

    info!(
        session_id = %session_id,
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        user_agent = %user_agent,
        reload = start_kind.is_reload(),
        "terminal connected"
    );
    let kind_label = if start_kind.is_reload() { "reload" } else { "new" };
    counter!("beach_pier_connections_total", 1, "kind" => kind_label);
    gauge!("beach_pier_pool_available", state.pool.available() as f64);

    if let Err(err) = state.manager.start_application(&context, start_kind) {
        error!(
            session_id = %session_id,
            connection_id = %connection_id,
            error = %err,
            "cannot start application"
        );
    }
    connection.open();
    let heartbeat = spawn_heartbeat(Arc::clone(&connection), state.config.heartbeat_interval);

    let idle_timeout = state.config.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;
    let mut live = flush(&connection).await;
    while live {
        let next = tokio::select! {
            _ = &mut superseded => {
                info!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    "socket released by its context"
                );
                break;
            }
            _ = context.updates_queued() => {
                live = flush(&connection).await;
                continue;
            }
            next = tokio::time::timeout_at(idle_deadline, ws_rx.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    idle_ms = idle_timeout.as_millis() as u64,
                    "idle timeout; closing socket"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                warn!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        idle_deadline = Instant::now() + idle_timeout;

        match message {
            Message::Text(text) => {
                connection.on_text(&text);
            }
            Message::Binary(bytes) => {
                connection.on_binary(&bytes);
            }
            Message::Close(frame) => {
                info!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "terminal closed websocket"
                );
                break;
            }
            _ => continue,
        }
        live = flush(&connection).await;
    }

    heartbeat.abort();
    connection.close().await;
    context.release_connection(connection_id);
    gauge!("beach_pier_pool_available", state.pool.available() as f64);
}

/// Flushes after an inbound message. Returns `false` once the context is
/// destroyed and the socket should close.
async fn flush(connection: &Connection<WsSink>) -> bool {
    match connection.flush().await {
        Ok(FlushOutcome::Sent { .. }) | Ok(FlushOutcome::Empty) => true,
        Ok(outcome) => {
            info!(
                session_id = %connection.context().session_id(),
                connection_id = %connection.id(),
                ?outcome,
                "flush incomplete"
            );
            true
        }
        Err(err) => {
            warn!(
                session_id = %connection.context().session_id(),
                connection_id = %connection.id(),
                error = %err,
                "flush refused; closing socket"
            );
            false
        }
    }
}
