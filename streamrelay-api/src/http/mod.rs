// HTTP server
//
// One port serves the viewer WebSocket (`/` and `/ws`), the health probe
// and the JSON status endpoint.

pub mod error;
pub mod health;
pub mod status;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use streamrelay_core::{Config, RelayHandle};

pub use error::{AppError, AppResult};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(relay: RelayHandle, config: Arc<Config>) -> Self {
        Self { relay, config }
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/status", get(status::get_status))
        .merge(health::create_health_router());

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
