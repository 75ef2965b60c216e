//! Metrics WebSocket Server - Ciclo di vita del server
//!
//! `MetricsWebSocketServer` possiede registro, verificatore e sorgente di
//! metriche per tutta la sua vita; ogni `start()` crea un nuovo listener,
//! un nuovo token di shutdown e un nuovo loop di broadcast, tutti
//! terminati da `stop()`.

pub mod tls;

use crate::core::auth::TokenVerifier;
use crate::core::config::{ServerConfig, ValidationResult};
use crate::core::error::ServerError;
use crate::core::state::AppState;
use crate::metrics::MetricsSource;
use crate::ws::broadcast::run_broadcast_loop;
use crate::ws::registry::{CloseReason, ConnectionRegistry};
use crate::create_router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use tls::{TLS_HANDSHAKE_TIMEOUT, TlsListener, load_tls_acceptor};

/// Margine oltre il write timeout concesso ai task per terminare
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Esito di `stop()`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Connessioni chiuse con 1001
    pub closed: usize,
    /// Task ancora attivi allo scadere del periodo di grazia
    pub pending: usize,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

pub struct MetricsWebSocketServer {
    config_tx: watch::Sender<Arc<ServerConfig>>,
    config_path: Option<PathBuf>,
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    source: Arc<dyn MetricsSource>,
    running: Mutex<Option<RunningServer>>,
    reload_lock: Mutex<()>,
}

impl MetricsWebSocketServer {
    pub fn new(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        source: Arc<dyn MetricsSource>,
    ) -> Result<Self, ServerError> {
        let validation = config.validate_all();
        if !validation.is_valid {
            return Err(ServerError::InvalidConfig(validation.errors));
        }

        let (config_tx, _) = watch::channel(Arc::new(config));
        Ok(Self {
            config_tx,
            config_path: None,
            registry: Arc::new(ConnectionRegistry::new()),
            verifier,
            source,
            running: Mutex::new(None),
            reload_lock: Mutex::new(()),
        })
    }

    /// File su cui salvare le configurazioni accettate da `reload_config`
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config_tx.borrow().clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.size()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Indirizzo effettivo del listener (utile con porta 0)
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Avvia listener e loop di broadcast.
    ///
    /// Ritorna l'indirizzo su cui il server accetta connessioni. Un secondo
    /// `start()` senza `stop()` fallisce con `AlreadyRunning`.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let config = self.config();
        let acceptor = if config.ssl {
            Some(load_tls_acceptor(&config).await?)
        } else {
            None
        };

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            verifier: self.verifier.clone(),
            source: self.source.clone(),
            config: self.config_tx.subscribe(),
            shutdown: shutdown.clone(),
            tasks: tasks.clone(),
        });
        let app = create_router(state);
        let signal = shutdown.clone().cancelled_owned();

        match acceptor {
            Some(acceptor) => {
                let listener = TlsListener::new(listener, acceptor, TLS_HANDSHAKE_TIMEOUT);
                tasks.spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(signal)
                        .await
                    {
                        error!("Server error: {}", e);
                    }
                });
            }
            None => {
                tasks.spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(signal)
                        .await
                    {
                        error!("Server error: {}", e);
                    }
                });
            }
        }

        tasks.spawn(run_broadcast_loop(
            self.registry.clone(),
            self.source.clone(),
            self.config_tx.subscribe(),
            shutdown.clone(),
        ));

        *running = Some(RunningServer {
            local_addr,
            shutdown,
            tasks,
        });

        let scheme = if config.ssl { "wss" } else { "ws" };
        info!("Server listening on {}://{}/ws", scheme, local_addr);
        Ok(local_addr)
    }

    /// Ferma il server: chiude tutte le connessioni con 1001, poi attende
    /// i task per un tempo limitato. Chiamarlo da fermo non fa nulla.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> StopReport {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            info!("Server is not running");
            return StopReport::default();
        };

        info!("Stopping server on {}", server.local_addr);
        let closed = self.registry.close_all(CloseReason::shutdown());
        server.shutdown.cancel();
        server.tasks.close();

        let grace = self.config().write_timeout() + STOP_GRACE;
        let mut pending = 0;
        if timeout(grace, server.tasks.wait()).await.is_err() {
            pending = server.tasks.len();
            warn!(pending, "Shutdown grace period elapsed with tasks still running");
        }

        info!(closed, "Server stopped");
        StopReport { closed, pending }
    }

    /// Valida e applica una nuova configurazione.
    ///
    /// Se la validazione fallisce (o il salvataggio su file) la
    /// configurazione in uso non cambia. Intervallo e metriche valgono dal
    /// tick successivo; host, porta e TLS solo al prossimo `start()`.
    #[instrument(skip(self, next))]
    pub async fn reload_config(&self, next: ServerConfig) -> ValidationResult {
        let _guard = self.reload_lock.lock().await;

        let result = next.validate_all();
        if !result.is_valid {
            warn!(errors = ?result.errors, "Configuration reload rejected");
            return result;
        }

        let current = self.config();
        let listener_changed = current.host != next.host
            || current.port != next.port
            || current.ssl != next.ssl
            || current.tls_cert_path != next.tls_cert_path
            || current.tls_key_path != next.tls_key_path;
        if listener_changed && self.is_running().await {
            warn!("Listener settings changed, they will apply on next start");
        }

        if let Some(path) = &self.config_path {
            if let Err(e) = next.persist(path).await {
                error!("Failed to persist configuration to {}: {}", path.display(), e);
                return ValidationResult::failed(vec![format!(
                    "failed to persist configuration: {}",
                    e
                )]);
            }
        }

        self.config_tx.send_replace(Arc::new(next));
        info!("Configuration reloaded");
        self.config().print_info();
        result
    }
}
