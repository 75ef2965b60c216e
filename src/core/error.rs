//! Error types - Errori ai confini del server
//!
//! Ogni confine (autenticazione, raccolta metriche, protocollo, invio,
//! ciclo di vita del server) ha il proprio tipo di errore; la politica di
//! propagazione la decide sempre il chiamante.

use axum::extract::ws::close_code;
use thiserror::Error;

/// Errori di verifica del token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    Missing,
    #[error("Invalid authentication token")]
    Invalid,
    #[error("Authentication token expired")]
    Expired,
    #[error("Authentication error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Codice di chiusura WebSocket da inviare al client
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::Internal(_) => close_code::ERROR,
            _ => close_code::POLICY,
        }
    }
}

/// Errori della sorgente di metriche
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics collection failed: {0}")]
    Collection(String),
    #[error("metrics serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errori di protocollo sui messaggi in ingresso, rimandati al client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Missing message type")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid metrics format")]
    InvalidMetrics,
    #[error("Binary messages are not supported")]
    BinaryFrame,
}

/// Errori di consegna verso una singola connessione
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out")]
    Timeout,
}

/// Errori del ciclo di vita del server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("listener address unavailable: {0}")]
    LocalAddr(#[source] std::io::Error),
}
