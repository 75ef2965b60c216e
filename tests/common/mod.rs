#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use metrics_ws::MetricsWebSocketServer;
use metrics_ws::auth::{JwtVerifier, TokenVerifier, encode_jwt};
use metrics_ws::config::ServerConfig;
use metrics_ws::core::error::MetricsError;
use metrics_ws::metrics::{MetricsSnapshot, MetricsSource};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_SECRET: &str = "ilmiobellissimosegretochevaassolutamentecambiato";

/// Tempo massimo di attesa per un singolo messaggio nei test
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Genera un JWT token valido per 24 ore
pub fn create_test_jwt(subject: &str) -> String {
    encode_jwt(subject, TEST_SECRET, chrono::Duration::hours(24)).expect("Failed to create JWT token")
}

/// Genera un JWT token già scaduto
pub fn create_expired_jwt(subject: &str) -> String {
    encode_jwt(subject, TEST_SECRET, chrono::Duration::minutes(-10))
        .expect("Failed to create JWT token")
}

/// Sorgente che restituisce `cpu` in sequenza, ripetendo l'ultimo valore
pub struct SequenceSource {
    values: Vec<i64>,
    calls: AtomicUsize,
}

impl SequenceSource {
    pub fn new(values: Vec<i64>) -> Self {
        Self {
            values,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for SequenceSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let value = self
            .values
            .get(n)
            .or(self.values.last())
            .copied()
            .unwrap_or_default();
        let mut metrics = BTreeMap::new();
        metrics.insert("cpu".to_string(), json!(value));
        metrics.insert("memory".to_string(), json!(50));
        Ok(MetricsSnapshot::new(metrics))
    }
}

/// Sorgente con tutte e tre le metriche, sempre uguali
pub struct StaticSource;

#[async_trait]
impl MetricsSource for StaticSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let mut metrics = BTreeMap::new();
        metrics.insert("cpu".to_string(), json!({ "percent": 12.5, "count": 8 }));
        metrics.insert("memory".to_string(), json!({ "total": 1024, "used": 512, "percent": 50.0 }));
        metrics.insert("disk".to_string(), json!({ "total": 2048, "used": 1024, "percent": 50.0 }));
        Ok(MetricsSnapshot::new(metrics).with_uptime(1_700_000_000))
    }
}

/// Sorgente con snapshot molto grandi, per saturare i buffer di un client
/// che non legge
pub struct LargeSource {
    pub bytes: usize,
}

#[async_trait]
impl MetricsSource for LargeSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let mut metrics = BTreeMap::new();
        metrics.insert("cpu".to_string(), json!("x".repeat(self.bytes)));
        Ok(MetricsSnapshot::new(metrics))
    }
}

/// Sorgente che fallisce sempre
pub struct FailingSource;

#[async_trait]
impl MetricsSource for FailingSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        Err(MetricsError::Collection("sensor offline".to_string()))
    }
}

/// Configurazione di test: loopback, porta effimera
pub fn test_config(interval_secs: i64) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        broadcast_interval_secs: interval_secs,
        write_timeout_ms: 1000,
        ..ServerConfig::default()
    }
}

/// Crea e avvia un server con il verificatore JWT di test
pub async fn start_server(
    config: ServerConfig,
    source: Arc<dyn MetricsSource>,
) -> (MetricsWebSocketServer, SocketAddr) {
    start_server_with(config, Arc::new(JwtVerifier::new(TEST_SECRET)), source).await
}

pub async fn start_server_with(
    config: ServerConfig,
    verifier: Arc<dyn TokenVerifier>,
    source: Arc<dyn MetricsSource>,
) -> (MetricsWebSocketServer, SocketAddr) {
    let server = MetricsWebSocketServer::new(config, verifier, source)
        .expect("Failed to create server");
    let addr = server.start().await.expect("Failed to start server");
    (server, addr)
}

pub fn ws_url(addr: SocketAddr, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("ws://{}/ws?token={}", addr, token),
        None => format!("ws://{}/ws", addr),
    }
}

pub async fn connect(addr: SocketAddr, token: Option<&str>) -> WsClient {
    let (ws, _) = connect_async(ws_url(addr, token))
        .await
        .expect("Failed to connect");
    ws
}

/// Prossimo messaggio di testo come JSON, ignorando i frame di controllo
pub async fn next_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("Invalid JSON"),
            Message::Close(frame) => panic!("Unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Legge fino al frame di chiusura e ne restituisce il codice
pub async fn next_close_code<S>(ws: &mut WebSocketStream<S>) -> Option<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for close frame");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Nomi delle metriche contenute in uno snapshot
pub fn metric_names(snapshot: &Value) -> Vec<String> {
    snapshot["metrics"]
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}
