//! Application State - Stato condiviso dalle route e dai task di connessione
//!
//! Un'istanza per ogni avvio del server: il registro e le sorgenti sono
//! quelle del server, mentre token di shutdown e tracker dei task sono
//! nuovi ad ogni `start()`.

use crate::core::auth::TokenVerifier;
use crate::core::config::ServerConfig;
use crate::metrics::MetricsSource;
use crate::ws::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct AppState {
    /// Connessioni autenticate attive
    pub registry: Arc<ConnectionRegistry>,

    /// Verifica dei bearer token presentati all'upgrade
    pub verifier: Arc<dyn TokenVerifier>,

    /// Sorgente degli snapshot iniziali
    pub source: Arc<dyn MetricsSource>,

    /// Configurazione corrente, sostituita atomicamente ad ogni reload
    pub config: watch::Receiver<Arc<ServerConfig>>,

    /// Cancellato da `stop()`
    pub shutdown: CancellationToken,

    /// Task per connessione (handler e writer), attesi da `stop()`
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn current_config(&self) -> Arc<ServerConfig> {
        self.config.borrow().clone()
    }
}
