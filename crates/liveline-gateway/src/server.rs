use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use liveline_config::LivelineConfig;

use crate::coordinator::{DuplexCoordinator, SessionTiming};
use crate::error::GatewayError;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::upstream::UpstreamEndpoint;

struct AppState {
    registry: Arc<SessionRegistry>,
    endpoint: UpstreamEndpoint,
    timing: SessionTiming,
    start_time: Instant,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    version: &'static str,
}

pub struct GatewayServer {
    registry: Arc<SessionRegistry>,
    endpoint: UpstreamEndpoint,
    timing: SessionTiming,
    allowed_origins: Vec<String>,
}

impl GatewayServer {
    pub fn new(config: &LivelineConfig) -> Self {
        Self::from_parts(
            UpstreamEndpoint::from_settings(&config.upstream),
            SessionTiming::from(&config.session),
        )
        .with_allowed_origins(config.server.allowed_origins.clone())
    }

    /// Server with an explicit upstream endpoint and timing and a
    /// permissive CORS policy.
    pub fn from_parts(endpoint: UpstreamEndpoint, timing: SessionTiming) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            endpoint,
            timing,
            allowed_origins: Vec::new(),
        }
    }

    /// Share an existing registry instead of the server's own.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Origins the CORS layer accepts. An empty list accepts any origin.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            endpoint: self.endpoint.clone(),
            timing: self.timing.clone(),
            start_time: Instant::now(),
        });
        Router::new()
            .route("/ws/{client_id}", axum::routing::any(ws_handler))
            .route("/health", axum::routing::get(health_handler))
            .with_state(state)
            .layer(cors_layer(&self.allowed_origins))
    }

    pub async fn start(&self, host: &str, port: u16) -> Result<(), GatewayError> {
        self.start_with_shutdown(host, port, std::future::pending())
            .await
    }

    /// Serve until `signal` resolves, then cancel every live session.
    pub async fn start_with_shutdown<F>(
        &self,
        host: &str,
        port: u16,
        signal: F,
    ) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::ServerError(e.to_string()))?;

        tracing::info!("Gateway started on ws://{}", addr);

        let registry = self.registry.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                let cancelled = registry.cancel_all().await;
                tracing::info!(sessions = cancelled, "Shutting down gateway");
            })
            .await
            .map_err(|e| GatewayError::ServerError(e.to_string()))?;

        Ok(())
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let active_sessions = state.registry.len().await;
    let uptime_secs = state.start_time.elapsed().as_secs();
    Json(HealthResponse {
        status: "ok",
        uptime_secs,
        active_sessions,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: Arc<AppState>) {
    let coordinator = DuplexCoordinator::new(
        Session::create(client_id),
        state.registry.clone(),
        state.endpoint.clone(),
        state.timing.clone(),
    );
    coordinator.run(socket).await;
}
