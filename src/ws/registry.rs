//! Connection Registry - Insieme delle connessioni autenticate
//!
//! Unico stato condiviso tra i task delle connessioni e il task di
//! broadcast. Ogni `Connection` viene creata solo dopo la verifica del
//! token, quindi nel registro non può mai finire un client non autenticato.

use crate::core::auth::Principal;
use crate::core::error::SendError;
use axum::extract::ws::{Utf8Bytes, close_code};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stati di una connessione registrata
///
/// Le fasi precedenti (upgrade e verifica del token) vivono solo dentro
/// `handle_socket`: una `Connection` esiste solo dopo l'autenticazione.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Registered = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Registered,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Codice e motivo del frame di chiusura
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "Connection closed")
    }

    pub fn shutdown() -> Self {
        Self::new(close_code::AWAY, "Server shutting down")
    }

    pub fn write_failure() -> Self {
        Self::new(close_code::ERROR, "Delivery failed")
    }
}

/// Una sessione WebSocket autenticata
pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    /// None o insieme vuoto = tutte le metriche
    subscriptions: RwLock<Option<HashSet<String>>>,
    outbound: mpsc::Sender<Utf8Bytes>,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Crea una connessione già autenticata.
    ///
    /// `outbound` è la coda letta dal task di scrittura, `cancel` viene
    /// cancellato alla chiusura (tipicamente un child token dello shutdown).
    pub fn new(
        principal: Principal,
        outbound: mpsc::Sender<Utf8Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            principal,
            subscriptions: RwLock::new(None),
            outbound,
            state: AtomicU8::new(ConnectionState::Registered as u8),
            close_reason: Mutex::new(None),
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Sostituisce le sottoscrizioni; una lista vuota torna a "tutte"
    pub fn set_subscriptions(&self, metrics: Vec<String>) {
        let next = if metrics.is_empty() {
            None
        } else {
            Some(metrics.into_iter().collect::<HashSet<_>>())
        };
        match self.subscriptions.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn subscriptions(&self) -> Option<HashSet<String>> {
        let guard = match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().filter(|set| !set.is_empty()).cloned()
    }

    /// Accoda un frame di testo con un tempo massimo di attesa
    pub async fn send(&self, text: Utf8Bytes, timeout: Duration) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.outbound
            .send_timeout(text, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::Timeout,
                SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    /// Passa a Closing e poi a Closed. Ritorna false se era già chiusa.
    ///
    /// Il frame di chiusura vero e proprio lo invia il task di scrittura
    /// quando osserva la cancellazione.
    pub fn close(&self, reason: CloseReason) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ConnectionState::Registered as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            return false;
        }

        match self.close_reason.lock() {
            Ok(mut guard) => *guard = Some(reason),
            Err(poisoned) => *poisoned.into_inner() = Some(reason),
        }
        self.cancel.cancel();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        true
    }

    pub fn take_close_reason(&self) -> Option<CloseReason> {
        match self.close_reason.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Risolve quando la connessione viene chiusa o il server si ferma
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: DashMap::new(),
        }
    }

    #[instrument(skip(self, conn), fields(conn_id = conn.id(), principal = %conn.principal()))]
    pub fn register(&self, conn: Arc<Connection>) {
        let id = conn.id();
        self.connections.entry(id).or_insert(conn);
        info!("Total connections: {}", self.connections.len());
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!("Connection removed from registry");
        }
        removed
    }

    /// Copia puntuale delle connessioni, iterabile senza tenere lock
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Rimuove la connessione e chiude il trasporto. Idempotente.
    #[instrument(skip(self, conn, reason), fields(conn_id = conn.id(), code = reason.code))]
    pub fn drop_connection(&self, conn: &Arc<Connection>, reason: CloseReason) {
        self.unregister(conn.id());
        if conn.close(reason) {
            info!("Connection closed");
        }
    }

    /// Chiude forzatamente tutte le connessioni, ritorna quante erano aperte
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let connections = self.snapshot();
        for conn in &connections {
            self.drop_connection(conn, reason.clone());
        }
        if !connections.is_empty() {
            warn!(count = connections.len(), "Force-closed all connections");
        }
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
