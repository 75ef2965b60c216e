use crate::AppState;
use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

/* stato del server per health check e dashboard:
   non richiede token, non espone nulla oltre al numero di connessioni
   e alla configurazione di broadcast corrente
*/
pub async fn root(State(state): State<Arc<AppState>>) -> Response {
    let config = state.current_config();
    Json(json!({
        "status": "ok",
        "message": "Server is running",
        "connections": state.registry.size(),
        "broadcast_interval_secs": config.broadcast_interval_secs,
        "enabled_metrics": config.enabled_metrics,
    }))
    .into_response()
}
