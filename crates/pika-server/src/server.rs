use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use pika_core::executor::ActionExecutor;
use pika_core::planner::Planner;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::NotificationBridge;
use crate::config::ServerConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::nudge::{NudgeCallback, NudgeScheduler};
use crate::session::{self, SessionConfig};

const SERVICE_NAME: &str = "PIKA";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub session_config: SessionConfig,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind, wire the hub, bridge and nudge scheduler, and serve until
/// [`ServerHandle::shutdown`].
pub async fn start(
    config: &ServerConfig,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn ActionExecutor>,
) -> Result<ServerHandle, ServerError> {
    let hub = Arc::new(Hub::new());
    let bridge = NotificationBridge::new(Arc::clone(&hub));
    let shutdown = CancellationToken::new();

    let nudge = Arc::new(NudgeScheduler::new(config.nudge.settings()));
    let announcer = bridge.clone();
    let callback: NudgeCallback = Arc::new(move |text: &str, emotion: &str| {
        let _ = announcer.announce(text, emotion);
    });
    nudge.set_callback(callback);
    let nudge_task = if config.nudge.enabled {
        nudge.start(shutdown.child_token())
    } else {
        tracing::info!("idle nudges disabled");
        None
    };

    let dispatcher = Arc::new(
        CommandDispatcher::new(planner, executor).with_activity_tracker(Arc::clone(&nudge)),
    );

    let state = AppState {
        hub: Arc::clone(&hub),
        dispatcher,
        session_config: config.session_config(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "PIKA server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        bridge,
        nudge,
        shutdown,
        server,
        nudge_task,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<Hub>,
    bridge: NotificationBridge,
    nudge: Arc<NudgeScheduler>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    nudge_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Entry point for external trigger sources.
    pub fn bridge(&self) -> &NotificationBridge {
        &self.bridge
    }

    pub fn nudge(&self) -> &Arc<NudgeScheduler> {
        &self.nudge
    }

    /// Stop accepting connections, close every session and wait briefly for
    /// background tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.hub.close_all();
        tracing::info!(closed, "shutting down");

        let mut server = self.server;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            tracing::warn!("server did not stop in time, aborting");
            server.abort();
        }
        if let Some(task) = self.nudge_task {
            let _ = task.await;
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.session_config.max_message_size)
        .on_upgrade(move |socket| {
            session::serve(
                socket,
                state.hub,
                state.dispatcher,
                state.session_config,
            )
        })
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "name": SERVICE_NAME }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ready",
        "connections": state.hub.client_count(),
        "ai_status": "ready",
    }))
}
