//! Multi-room Axum gridmatch server.
//!
//! # Routes
//!
//! | Method | Path            | Description                              |
//! |--------|-----------------|------------------------------------------|
//! | `GET`  | `/`             | Serve the static web frontend            |
//! | `GET`  | `/ws`           | WebSocket upgrade for match connections  |
//! | `GET`  | `/api/rooms`    | List active room IDs (JSON)              |
//!
//! Configuration comes from the environment; see [`config::Config`].

mod config;
mod inference;
mod match_logic;
mod narration;
mod room;
mod signals;
mod sweeper;
mod timers;
mod ws_handler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::EnvFilter;

use config::Config;
use inference::InferenceClient;
use room::RoomManager;
use timers::ReconnectTimers;

/// Shared application state available to all handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub timers: Arc<ReconnectTimers>,
    pub inference: Arc<InferenceClient>,
    pub config: Arc<Config>,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let inference = InferenceClient::from_config(&config);
        Self {
            manager: Arc::new(RoomManager::new()),
            timers: Arc::new(ReconnectTimers::new()),
            inference: Arc::new(inference),
            config: Arc::new(config),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand out a fresh connection ID. Connection identity is transport
    /// scoped; seat identity lives in the player token.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[tokio::main]
async fn main() {
    // Initialise tracing (respects RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let port = config.port;
    let static_dir = config.static_dir.clone();
    let state = AppState::new(config);

    if !state.inference.enabled() {
        tracing::warn!("No inference API key configured — heuristic signals only, no narration");
    }

    sweeper::spawn(Arc::clone(&state.manager), Arc::clone(&state.config));

    // Serve the SPA: try static files first, fall back to index.html for
    // client-side routing.
    let serve_spa = ServeDir::new(&static_dir)
        .not_found_service(ServeFile::new(format!("{static_dir}/index.html")));

    let app = Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/api/rooms", get(rooms_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(serve_spa);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gridmatch server listening on {addr}");
    tracing::info!("Serving static files from {static_dir}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// `GET /ws` — upgrade to WebSocket and hand off to [`ws_handler::handle_socket`].
async fn ws_upgrade_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_handler::handle_socket(socket, state))
}

/// `GET /api/rooms` — return a JSON array of active room IDs.
async fn rooms_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.list_rooms().await)
}
