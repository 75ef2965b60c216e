//! WebSocket Module - Broadcast delle metriche in tempo reale
//!
//! Questo modulo gestisce le connessioni WebSocket dei client della dashboard:
//! - Upgrade HTTP -> WebSocket e verifica del token
//! - Registro delle connessioni autenticate
//! - Protocollo dei messaggi di controllo (ping, subscribe)
//! - Loop periodico di broadcast degli snapshot

pub mod broadcast;
pub mod connection;
pub mod protocol;
pub mod registry;

// Re-exports pubblici
pub use broadcast::{TickReport, broadcast_tick, run_broadcast_loop};
pub use connection::handle_socket;
pub use registry::{CloseReason, Connection, ConnectionId, ConnectionRegistry, ConnectionState};

use crate::AppState;
use axum::{
    extract::{Query, State, rejection::QueryRejection, ws::WebSocketUpgrade},
    http::{HeaderMap, header},
    response::Response,
};
use axum_macros::debug_handler;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Frame in coda per connessione prima che l'invio vada in timeout
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// Estrae il token da `Authorization: Bearer <token>`
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => {
            Some(token.to_string())
        }
        _ => None,
    }
}

/// Entry point per gestire richieste di upgrade WebSocket
/// Operazioni:
/// 1. Estrarre il token da `?token=` (o dall'header Authorization);
///    una query non decodificabile (es. `token` ripetuto) vale come token assente
/// 2. Eseguire upgrade HTTP -> WebSocket
/// 3. Passare la connessione ad handle_socket, che verifica il token
///
/// L'autenticazione avviene dopo l'upgrade così che il client riceva un
/// frame di chiusura con codice 1008 invece di un errore HTTP.
#[debug_handler]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    query: Result<Query<WsAuthQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let query_token = match query {
        Ok(Query(query)) => query.token,
        Err(e) => {
            debug!("Ignoring malformed upgrade query: {}", e);
            None
        }
    };
    let token = query_token.or_else(|| bearer_token(&headers));
    let tasks = state.tasks.clone();

    ws.on_upgrade(move |socket| tasks.track_future(handle_socket(socket, state, token)))
}
