//! Metrics WebSocket server - espone i moduli principali per i test

pub mod core;
pub mod metrics;
pub mod server;
pub mod services;
pub mod ws;

// Re-export dei tipi principali per facilitare l'import
pub use crate::core::{AppState, auth, config};
pub use metrics::{MetricsSnapshot, MetricsSource, SystemMetricsSource};
pub use server::{MetricsWebSocketServer, StopReport};
pub use services::root;

use axum::{
    Router,
    routing::{any, get},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Crea il router principale dell'applicazione
pub fn create_router(state: Arc<AppState>) -> Router {
    use ws::ws_handler;

    Router::new()
        .route("/", get(root))
        // il token viene verificato dopo l'upgrade, dentro handle_socket
        .route("/ws", any(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
