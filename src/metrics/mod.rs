//! Metrics Module - Snapshot delle metriche e sorgenti
//!
//! Il server non calcola le metriche: le chiede ad una `MetricsSource` una
//! volta per tick di broadcast e una volta per ogni nuova connessione.

pub mod system;

pub use system::SystemMetricsSource;

use crate::core::error::MetricsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Mappa immutabile nome metrica -> valore, con timestamp di raccolta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    /// Boot time dell'host in secondi (epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
}

impl MetricsSnapshot {
    pub fn new(metrics: BTreeMap<String, Value>) -> Self {
        Self {
            metrics,
            timestamp: Utc::now(),
            uptime: None,
        }
    }

    pub fn with_uptime(mut self, uptime: u64) -> Self {
        self.uptime = Some(uptime);
        self
    }

    /// Nuovo snapshot con le sole metriche abilitate in configurazione
    pub fn retain_enabled(&self, enabled: &[String]) -> Self {
        Self {
            metrics: self
                .metrics
                .iter()
                .filter(|(name, _)| enabled.iter().any(|e| e == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            timestamp: self.timestamp,
            uptime: self.uptime,
        }
    }

    /// Nuovo snapshot ristretto alle metriche sottoscritte dal client
    pub fn filtered(&self, subscribed: &HashSet<String>) -> Self {
        Self {
            metrics: self
                .metrics
                .iter()
                .filter(|(name, _)| subscribed.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            timestamp: self.timestamp,
            uptime: self.uptime,
        }
    }

    pub fn to_json(&self) -> Result<String, MetricsError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Produce uno snapshot su richiesta
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError>;
}
