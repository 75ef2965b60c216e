//! WebSocket Connection Management - Ciclo di vita di una connessione
//!
//! Upgrade e verifica del token avvengono qui, prima che esista una
//! `Connection`; da lì in poi lo stato (Registered -> Closing -> Closed) è
//! quello della `Connection`. Un token non valido chiude il trasporto senza
//! mai passare dal registro.

use crate::core::auth::{Principal, TokenVerifier};
use crate::core::config::ServerConfig;
use crate::core::error::{AuthError, ProtocolError, SendError};
use crate::ws::OUTBOUND_QUEUE_CAPACITY;
use crate::ws::protocol::{ClientMessage, ServerMessage};
use crate::ws::registry::{CloseReason, Connection, ConnectionRegistry};
use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Limite RFC 6455 per il motivo di un frame di chiusura
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Attesa massima per il frame di chiusura dopo la cancellazione
pub const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn close_frame(reason: &CloseReason) -> CloseFrame {
    let mut text = reason.reason.clone();
    if text.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    CloseFrame {
        code: reason.code,
        reason: Utf8Bytes::from(text),
    }
}

pub fn authenticate(
    verifier: &dyn TokenVerifier,
    token: Option<&str>,
) -> Result<Principal, AuthError> {
    match token {
        Some(token) => verifier.verify(token),
        None => Err(AuthError::Missing),
    }
}

#[instrument(skip(socket, state, token))]
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    debug!("WebSocket handshake completed, authenticating");
    let config = state.current_config();

    let principal = match authenticate(state.verifier.as_ref(), token.as_deref()) {
        Ok(principal) => principal,
        Err(err) => {
            warn!(error = %err, "Rejecting unauthenticated connection");
            let reason = CloseReason::new(err.close_code(), err.to_string());
            reject(socket, &reason, config.write_timeout()).await;
            return;
        }
    };

    if state.shutdown.is_cancelled() {
        reject(socket, &CloseReason::shutdown(), config.write_timeout()).await;
        return;
    }

    // Dividiamo il WebSocket in due metà: sender e receiver
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Utf8Bytes>(OUTBOUND_QUEUE_CAPACITY);

    let conn = Arc::new(Connection::new(
        principal,
        out_tx,
        state.shutdown.child_token(),
    ));
    state.registry.register(conn.clone());
    info!(
        conn_id = conn.id(),
        principal = %conn.principal(),
        state = ?conn.state(),
        "Connection registered"
    );

    state.tasks.spawn(write_ws(
        conn.clone(),
        ws_tx,
        out_rx,
        state.registry.clone(),
        config.write_timeout(),
    ));

    send_initial_snapshot(&state, &conn, &config).await;
    listen_ws(conn.clone(), ws_rx, state.registry.clone(), config.write_timeout()).await;

    // Cleanup
    state.registry.drop_connection(&conn, CloseReason::normal());
    info!(conn_id = conn.id(), state = ?conn.state(), "Connection handler terminated");
}

/// Chiude un trasporto mai registrato (Authenticating -> Closed)
async fn reject(mut socket: WebSocket, reason: &CloseReason, write_timeout: Duration) {
    let frame = Message::Close(Some(close_frame(reason)));
    match timeout(write_timeout, socket.send(frame)).await {
        Ok(Ok(())) => debug!(code = reason.code, "Close frame sent"),
        Ok(Err(e)) => debug!("Failed to send close frame: {:?}", e),
        Err(_) => debug!("Timed out sending close frame"),
    }
}

async fn send_initial_snapshot(state: &AppState, conn: &Arc<Connection>, config: &ServerConfig) {
    let collected = tokio::select! {
        biased;
        _ = conn.cancelled() => return,
        collected = state.source.collect() => collected,
    };

    let payload = match collected
        .and_then(|snapshot| snapshot.retain_enabled(&config.enabled_metrics).to_json())
    {
        Ok(json) => Utf8Bytes::from(json),
        Err(e) => {
            error!("Error sending initial data: {}", e);
            ServerMessage::Error("Failed to collect metrics".to_string()).encode()
        }
    };

    if let Err(e) = conn.send(payload, config.write_timeout()).await {
        warn!(conn_id = conn.id(), error = %e, "Failed to queue initial snapshot");
    }
}

#[instrument(skip_all, fields(conn_id = conn.id()))]
pub async fn write_ws(
    conn: Arc<Connection>,
    mut websocket_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Utf8Bytes>,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
) {
    debug!("Write task started");

    loop {
        tokio::select! {
            biased;
            _ = conn.cancelled() => break,
            frame = outbound_rx.recv() => {
                let Some(text) = frame else {
                    break;
                };
                // una scrittura bloccata non deve ritardare lo shutdown
                let written = tokio::select! {
                    biased;
                    _ = conn.cancelled() => break,
                    written = timeout(write_timeout, websocket_tx.send(Message::Text(text))) => written,
                };
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to write to WebSocket: {:?}", e);
                        registry.drop_connection(&conn, CloseReason::write_failure());
                        break;
                    }
                    Err(_) => {
                        warn!(timeout_ms = write_timeout.as_millis() as u64, "WebSocket write timed out");
                        registry.drop_connection(&conn, CloseReason::write_failure());
                        break;
                    }
                }
            }
        }
    }

    let reason = conn.take_close_reason().unwrap_or_else(CloseReason::shutdown);
    let close = Message::Close(Some(close_frame(&reason)));
    let close_timeout = write_timeout.min(CLOSE_FRAME_TIMEOUT);
    if !matches!(timeout(close_timeout, websocket_tx.send(close)).await, Ok(Ok(()))) {
        debug!("Close frame not delivered");
    }

    debug!("Write task terminated");
}

#[instrument(skip_all, fields(conn_id = conn.id()))]
pub async fn listen_ws(
    conn: Arc<Connection>,
    mut websocket_rx: SplitStream<WebSocket>,
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
) {
    debug!("Listen task started");

    loop {
        let next = tokio::select! {
            biased;
            _ = conn.cancelled() => {
                debug!("Connection cancelled");
                break;
            }
            next = websocket_rx.next() => next,
        };

        let msg = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!("WebSocket error: {:?}", e);
                break;
            }
            None => {
                info!("WebSocket stream ended");
                break;
            }
        };

        let reply = match msg {
            Message::Text(text) => process_message(&conn, text.as_str(), write_timeout).await,
            Message::Binary(_) => {
                let err = ProtocolError::BinaryFrame;
                conn.send(ServerMessage::from(&err).encode(), write_timeout).await
            }
            Message::Close(_) => {
                info!("Close message received");
                break;
            }
            // ping/pong di controllo gestiti da axum
            _ => Ok(()),
        };

        if let Err(e) = reply {
            warn!(error = %e, "Failed to reply to client");
            if e == SendError::Timeout {
                registry.drop_connection(&conn, CloseReason::write_failure());
            }
            break;
        }
    }

    debug!("Listen task terminated");
}

/// Gestisce un messaggio di controllo del client; gli errori di protocollo
/// tornano al client senza chiudere la connessione
pub async fn process_message(
    conn: &Connection,
    text: &str,
    write_timeout: Duration,
) -> Result<(), SendError> {
    match ClientMessage::decode(text) {
        Ok(ClientMessage::Ping) => conn.send(ServerMessage::Pong.encode(), write_timeout).await,
        Ok(ClientMessage::Subscribe { metrics }) => {
            info!(conn_id = conn.id(), ?metrics, "Subscription updated");
            conn.set_subscriptions(metrics);
            Ok(())
        }
        Err(err) => {
            warn!(conn_id = conn.id(), error = %err, "Invalid client message");
            conn.send(ServerMessage::from(&err).encode(), write_timeout)
                .await
        }
    }
}
