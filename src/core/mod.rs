//! Core Module - Componenti infrastrutturali del server
//!
//! Questo modulo contiene tutti i componenti "core":
//! - Autenticazione e JWT
//! - Configurazione
//! - Gestione errori
//! - Stato condiviso

pub mod auth;
pub mod config;
pub mod error;
pub mod state;

// Re-exports per facilitare l'import
pub use auth::{Claims, JwtVerifier, Principal, TokenVerifier, encode_jwt};
pub use config::{ServerConfig, ValidationResult};
pub use error::{AuthError, MetricsError, ProtocolError, SendError, ServerError};
pub use state::AppState;
