//! Server Configuration - Configurazione del server WebSocket
//!
//! La configurazione si carica dalle variabili d'ambiente (`.env` incluso)
//! oppure da un file JSON con lo stesso layout della dashboard
//! (`websocket` + `metrics`). Le stesse regole di validazione valgono
//! all'avvio e ad ogni reload.

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

/// Metriche che la sorgente di sistema sa produrre
pub const KNOWN_METRICS: [&str; 3] = ["cpu", "memory", "disk"];

const DEFAULT_JWT_SECRET: &str = "un segreto meno bello";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_tls_paths", skip_on_field_errors = false))]
pub struct ServerConfig {
    #[validate(length(min = 1, message = "host must not be empty"))]
    pub host: String,
    /// 0 = porta effimera scelta dal sistema operativo
    pub port: u16,
    pub ssl: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    #[validate(range(
        min = 1,
        max = 3600,
        message = "broadcast interval must be between 1 and 3600 seconds"
    ))]
    pub broadcast_interval_secs: i64,
    #[validate(
        length(min = 1, message = "at least one metric must be enabled"),
        custom(function = "validate_metric_names")
    )]
    pub enabled_metrics: Vec<String>,
    #[validate(range(
        min = 10,
        max = 60000,
        message = "write timeout must be between 10 and 60000 milliseconds"
    ))]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            ssl: false,
            tls_cert_path: None,
            tls_key_path: None,
            broadcast_interval_secs: 60,
            enabled_metrics: KNOWN_METRICS.iter().map(|m| m.to_string()).collect(),
            write_timeout_ms: 5000,
        }
    }
}

/// Esito della validazione di una configurazione
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

impl From<ValidationErrors> for ValidationResult {
    fn from(errors: ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let detail = match &e.message {
                        Some(message) => message.to_string(),
                        None => e.code.to_string(),
                    };
                    if field == "__all__" {
                        detail
                    } else {
                        format!("{}: {}", field, detail)
                    }
                })
            })
            .collect();
        messages.sort();
        Self::failed(messages)
    }
}

#[allow(clippy::ptr_arg)]
fn validate_metric_names(names: &Vec<String>) -> Result<(), ValidationError> {
    if let Some(unknown) = names.iter().find(|n| !KNOWN_METRICS.contains(&n.as_str())) {
        let mut err = ValidationError::new("unknown_metric");
        err.message = Some(Cow::Owned(format!(
            "unknown metric '{}', expected one of {:?}",
            unknown, KNOWN_METRICS
        )));
        return Err(err);
    }
    Ok(())
}

fn validate_tls_paths(config: &ServerConfig) -> Result<(), ValidationError> {
    if config.ssl && (config.tls_cert_path.is_none() || config.tls_key_path.is_none()) {
        let mut err = ValidationError::new("tls_paths");
        err.message = Some(Cow::Borrowed(
            "ssl requires both tls_cert_path and tls_key_path",
        ));
        return Err(err);
    }
    Ok(())
}

impl ServerConfig {
    /// Valida la configurazione raccogliendo tutti gli errori
    pub fn validate_all(&self) -> ValidationResult {
        match self.validate() {
            Ok(()) => ValidationResult::ok(),
            Err(errors) => errors.into(),
        }
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs.max(1) as u64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Carica la configurazione dalle variabili d'ambiente
    /// Chiama dotenv() automaticamente
    pub fn from_env() -> Result<Self, String> {
        dotenv().ok();
        let defaults = Self::default();

        let host = env::var("WS_HOST").unwrap_or(defaults.host);
        let port = parse_env("WS_PORT", defaults.port)?;
        let ssl = parse_bool_env("WS_SSL", defaults.ssl)?;
        let tls_cert_path = env::var("WS_TLS_CERT").ok().map(PathBuf::from);
        let tls_key_path = env::var("WS_TLS_KEY").ok().map(PathBuf::from);
        let broadcast_interval_secs =
            parse_env("METRICS_INTERVAL", defaults.broadcast_interval_secs)?;
        let enabled_metrics = match env::var("ENABLED_METRICS") {
            Ok(list) => parse_metric_list(&list),
            Err(_) => defaults.enabled_metrics,
        };
        let write_timeout_ms = parse_env("WS_WRITE_TIMEOUT_MS", defaults.write_timeout_ms)?;

        Ok(ServerConfig {
            host,
            port,
            ssl,
            tls_cert_path,
            tls_key_path,
            broadcast_interval_secs,
            enabled_metrics,
            write_timeout_ms,
        })
    }

    /// Carica la configurazione da un file JSON e applica gli override
    /// d'ambiente (`WS_PORT`, `METRICS_INTERVAL`)
    pub fn load(path: &Path) -> Result<Self, String> {
        dotenv().ok();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config file {}: {}", path.display(), e))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid config file {}: {}", path.display(), e))?;

        let mut config = ServerConfig::from(file);
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), String> {
        if env::var("WS_PORT").is_ok() {
            self.port = parse_env("WS_PORT", self.port)?;
        }
        if env::var("METRICS_INTERVAL").is_ok() {
            self.broadcast_interval_secs =
                parse_env("METRICS_INTERVAL", self.broadcast_interval_secs)?;
        }
        Ok(())
    }

    /// Scrive la configurazione su file preservando le sezioni non gestite
    /// dal server (database, logging, ...)
    pub async fn persist(&self, path: &Path) -> std::io::Result<()> {
        let mut root = match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e),
        };

        let file = ConfigFile::from(self);
        merge_section(&mut root, "websocket", serde_json::to_value(&file.websocket)?);
        merge_section(&mut root, "metrics", serde_json::to_value(&file.metrics)?);

        let json = serde_json::to_string_pretty(&Value::Object(root))?;
        tokio::fs::write(path, json).await
    }

    /// Stampa la configurazione (nascondendo i segreti)
    pub fn print_info(&self) {
        info!("Server Configuration:");
        info!("   Server Address: {}", self.bind_addr());
        info!("   TLS: {}", if self.ssl { "enabled" } else { "disabled" });
        info!("   Broadcast Interval: {}s", self.broadcast_interval_secs);
        info!("   Enabled Metrics: {}", self.enabled_metrics.join(", "));
        info!("   Write Timeout: {}ms", self.write_timeout_ms);
    }
}

/// Legge il segreto JWT condiviso con la dashboard
pub fn jwt_secret_from_env() -> String {
    dotenv().ok();
    env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set, using default (not secure for production!)");
        DEFAULT_JWT_SECRET.to_string()
    })
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("Invalid {}: cannot parse '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, String> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(format!("Invalid {}: expected a boolean, got '{}'", key, raw)),
        },
        Err(_) => Ok(default),
    }
}

fn parse_metric_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .collect()
}

fn merge_section(root: &mut Map<String, Value>, key: &str, section: Value) {
    match (root.get_mut(key), section) {
        (Some(Value::Object(existing)), Value::Object(update)) => {
            existing.extend(update);
        }
        (_, section) => {
            root.insert(key.to_string(), section);
        }
    }
}

/// Layout del file di configurazione della dashboard
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    websocket: WebsocketSection,
    metrics: MetricsSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebsocketSection {
    host: String,
    port: u16,
    #[serde(default)]
    ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls_cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls_key_path: Option<PathBuf>,
    #[serde(default = "default_write_timeout_ms")]
    write_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetricsSection {
    collection_interval: i64,
    #[serde(default = "default_enabled_metrics")]
    enabled_metrics: Vec<String>,
}

fn default_write_timeout_ms() -> u64 {
    ServerConfig::default().write_timeout_ms
}

fn default_enabled_metrics() -> Vec<String> {
    ServerConfig::default().enabled_metrics
}

impl From<ConfigFile> for ServerConfig {
    fn from(file: ConfigFile) -> Self {
        Self {
            host: file.websocket.host,
            port: file.websocket.port,
            ssl: file.websocket.ssl,
            tls_cert_path: file.websocket.tls_cert_path,
            tls_key_path: file.websocket.tls_key_path,
            broadcast_interval_secs: file.metrics.collection_interval,
            enabled_metrics: file.metrics.enabled_metrics,
            write_timeout_ms: file.websocket.write_timeout_ms,
        }
    }
}

impl From<&ServerConfig> for ConfigFile {
    fn from(config: &ServerConfig) -> Self {
        Self {
            websocket: WebsocketSection {
                host: config.host.clone(),
                port: config.port,
                ssl: config.ssl,
                tls_cert_path: config.tls_cert_path.clone(),
                tls_key_path: config.tls_key_path.clone(),
                write_timeout_ms: config.write_timeout_ms,
            },
            metrics: MetricsSection {
                collection_interval: config.broadcast_interval_secs,
                enabled_metrics: config.enabled_metrics.clone(),
            },
        }
    }
}
