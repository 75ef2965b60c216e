//! Broadcast Loop - Invio periodico degli snapshot a tutti i client
//!
//! Un solo task per server: ad ogni tick raccoglie uno snapshot e lo
//! consegna a ogni connessione registrata. Le connessioni che non riescono
//! a ricevere entro il write timeout vengono rimosse dal registro senza
//! interrompere la consegna alle altre.

use crate::core::config::ServerConfig;
use crate::metrics::{MetricsSnapshot, MetricsSource};
use crate::ws::registry::{CloseReason, Connection, ConnectionId, ConnectionRegistry};
use axum::extract::ws::Utf8Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Esito di un singolo tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
    pub collect_failed: bool,
}

/// Il primo tick scatta dopo un periodo intero, non subito
fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Chiave di cache: le metriche sottoscritte ordinate, None = tutte
fn subscription_key(conn: &Connection) -> Option<Vec<String>> {
    conn.subscriptions().map(|set| {
        let mut names: Vec<String> = set.into_iter().collect();
        names.sort();
        names
    })
}

/// Serializza lo snapshot una volta per ogni insieme di sottoscrizioni distinto
fn encode_for(
    cache: &mut HashMap<Option<Vec<String>>, Option<Utf8Bytes>>,
    snapshot: &MetricsSnapshot,
    conn: &Connection,
) -> Option<Utf8Bytes> {
    let key = subscription_key(conn);
    cache
        .entry(key)
        .or_insert_with_key(|key| {
            let view = match key {
                Some(names) => snapshot.filtered(&names.iter().cloned().collect()),
                None => snapshot.clone(),
            };
            match view.to_json() {
                Ok(json) => Some(Utf8Bytes::from(json)),
                Err(e) => {
                    error!("Failed to serialize snapshot: {}", e);
                    None
                }
            }
        })
        .clone()
}

/// Esegue un tick: raccolta, serializzazione e fan-out concorrente
///
/// Con registro vuoto la sorgente non viene nemmeno interrogata.
pub async fn broadcast_tick(
    registry: &ConnectionRegistry,
    source: &dyn MetricsSource,
    config: &ServerConfig,
) -> TickReport {
    let connections = registry.snapshot();
    if connections.is_empty() {
        return TickReport::default();
    }

    let snapshot = match source.collect().await {
        Ok(snapshot) => snapshot.retain_enabled(&config.enabled_metrics),
        Err(e) => {
            warn!(error = %e, "Metrics collection failed, skipping tick");
            return TickReport {
                recipients: connections.len(),
                collect_failed: true,
                ..TickReport::default()
            };
        }
    };

    let mut cache = HashMap::new();
    let mut report = TickReport {
        recipients: connections.len(),
        ..TickReport::default()
    };

    let write_timeout = config.write_timeout();
    let mut deliveries = Vec::with_capacity(connections.len());
    for conn in &connections {
        let Some(payload) = encode_for(&mut cache, &snapshot, conn) else {
            continue;
        };
        deliveries.push(async move { (conn, conn.send(payload, write_timeout).await) });
    }

    for (conn, result) in join_all(deliveries).await {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(conn_id = conn.id(), error = %e, "Dropping connection after failed delivery");
                registry.drop_connection(conn, CloseReason::write_failure());
                report.dropped.push(conn.id());
            }
        }
    }

    report
}

/// Loop di broadcast, termina quando `shutdown` viene cancellato
///
/// Un cambio di configurazione vale dal tick successivo; se cambia
/// l'intervallo il ticker viene ricreato.
#[instrument(skip_all)]
pub async fn run_broadcast_loop(
    registry: Arc<ConnectionRegistry>,
    source: Arc<dyn MetricsSource>,
    mut config_rx: watch::Receiver<Arc<ServerConfig>>,
    shutdown: CancellationToken,
) {
    let mut config = config_rx.borrow_and_update().clone();
    let mut ticker = new_ticker(config.broadcast_interval());
    let mut watching = true;
    info!(interval_secs = config.broadcast_interval_secs, "Broadcast loop started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = config_rx.changed(), if watching => {
                if changed.is_err() {
                    // sender rilasciato: si continua con l'ultima configurazione
                    watching = false;
                    continue;
                }
                let next = config_rx.borrow_and_update().clone();
                if next.broadcast_interval() != config.broadcast_interval() {
                    info!(
                        from = config.broadcast_interval_secs,
                        to = next.broadcast_interval_secs,
                        "Broadcast interval changed"
                    );
                    ticker = new_ticker(next.broadcast_interval());
                }
                config = next;
            }
            _ = ticker.tick() => {
                let report = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    report = broadcast_tick(&registry, source.as_ref(), &config) => report,
                };
                if report.recipients > 0 {
                    debug!(
                        recipients = report.recipients,
                        delivered = report.delivered,
                        dropped = report.dropped.len(),
                        "Broadcast tick completed"
                    );
                }
            }
        }
    }

    info!("Broadcast loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::Principal;
    use crate::core::error::MetricsError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl MetricsSource for CountingSource {
        async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MetricsError::Collection("sensor offline".into()));
            }
            let mut metrics = BTreeMap::new();
            metrics.insert("cpu".to_string(), json!({ "percent": n }));
            metrics.insert("memory".to_string(), json!({ "percent": 50 }));
            Ok(MetricsSnapshot::new(metrics))
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            broadcast_interval_secs: 1,
            write_timeout_ms: 50,
            ..ServerConfig::default()
        }
    }

    fn register(registry: &ConnectionRegistry) -> (Arc<Connection>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let conn = Arc::new(Connection::new(
            Principal::new("tester"),
            tx,
            CancellationToken::new(),
        ));
        registry.register(conn.clone());
        (conn, rx)
    }

    fn parse(frame: Utf8Bytes) -> Value {
        serde_json::from_str(frame.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_registry_skips_collection() {
        let registry = ConnectionRegistry::new();
        let source = CountingSource::new(false);

        let report = broadcast_tick(&registry, &source, &config()).await;

        assert_eq!(report, TickReport::default());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_block_others() {
        let registry = ConnectionRegistry::new();
        let source = CountingSource::new(false);
        let (_a, mut rx_a) = register(&registry);
        let (b, rx_b) = register(&registry);
        let (_c, mut rx_c) = register(&registry);
        drop(rx_b);

        let report = broadcast_tick(&registry, &source, &config()).await;

        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec![b.id()]);
        assert_eq!(registry.size(), 2);
        assert!(!b.is_open());
        assert!(parse(rx_a.recv().await.unwrap())["metrics"]["cpu"].is_object());
        assert!(parse(rx_c.recv().await.unwrap())["metrics"]["cpu"].is_object());
    }

    #[tokio::test]
    async fn test_collect_failure_sends_nothing() {
        let registry = ConnectionRegistry::new();
        let source = CountingSource::new(true);
        let (conn, mut rx) = register(&registry);

        let report = broadcast_tick(&registry, &source, &config()).await;

        assert!(report.collect_failed);
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
        assert!(conn.is_open());
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn test_subscriptions_and_enabled_metrics_filter_payload() {
        let registry = ConnectionRegistry::new();
        let source = CountingSource::new(false);
        let (all, mut rx_all) = register(&registry);
        let (cpu_only, mut rx_cpu) = register(&registry);
        cpu_only.set_subscriptions(vec!["cpu".into()]);

        let report = broadcast_tick(&registry, &source, &config()).await;
        assert_eq!(report.delivered, 2);

        let full = parse(rx_all.recv().await.unwrap());
        let filtered = parse(rx_cpu.recv().await.unwrap());
        assert_eq!(full["metrics"].as_object().unwrap().len(), 2);
        assert_eq!(filtered["metrics"].as_object().unwrap().len(), 1);
        assert_eq!(full["timestamp"], filtered["timestamp"]);

        // metriche disabilitate non arrivano a nessuno
        let mut limited = config();
        limited.enabled_metrics = vec!["memory".into()];
        broadcast_tick(&registry, &source, &limited).await;
        let full = parse(rx_all.recv().await.unwrap());
        assert!(full["metrics"].get("cpu").is_none());
        assert!(all.is_open());
    }

    #[tokio::test]
    async fn test_loop_broadcasts_and_stops_on_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let source: Arc<dyn MetricsSource> = Arc::new(CountingSource::new(false));
        let (_conn, mut rx) = register(&registry);
        let (_config_tx, config_rx) = watch::channel(Arc::new(config()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_broadcast_loop(
            registry.clone(),
            source,
            config_rx,
            shutdown.clone(),
        ));

        // nessun tick immediato
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
        let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(parse(frame)["timestamp"].is_string());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
