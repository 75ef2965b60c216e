//! Sorgente di metriche di sistema basata su `sysinfo`
//!
//! Raccoglie CPU, memoria e disco della macchina che ospita il server.
//! L'utilizzo CPU è un delta tra due refresh: la prima raccolta attende
//! `MINIMUM_CPU_UPDATE_INTERVAL`, le successive misurano l'intervallo
//! trascorso dalla raccolta precedente.

use crate::core::error::MetricsError;
use crate::metrics::{MetricsSnapshot, MetricsSource};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use sysinfo::{Disks, MINIMUM_CPU_UPDATE_INTERVAL, System};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

struct SamplerState {
    sys: System,
    primed: bool,
}

pub struct SystemMetricsSource {
    state: Mutex<SamplerState>,
}

impl SystemMetricsSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SamplerState {
                sys: System::new(),
                primed: false,
            }),
        }
    }
}

impl Default for SystemMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(used as f64 / total as f64 * 100.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Usa il disco montato su `/` se presente, altrimenti somma tutti i dischi
fn disk_usage(disks: &Disks) -> (u64, u64) {
    let root = disks.list().iter().find(|d| d.mount_point() == Path::new("/"));
    match root {
        Some(disk) => (disk.total_space(), disk.total_space().saturating_sub(disk.available_space())),
        None => disks.list().iter().fold((0, 0), |(total, used), disk| {
            (
                total + disk.total_space(),
                used + (disk.total_space().saturating_sub(disk.available_space())),
            )
        }),
    }
}

#[async_trait]
impl MetricsSource for SystemMetricsSource {
    #[instrument(skip(self))]
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(MetricsError::Collection(
                "system metrics are not supported on this platform".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if !state.primed {
            state.sys.refresh_cpu_usage();
            tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
            state.primed = true;
        }
        state.sys.refresh_cpu_usage();
        state.sys.refresh_memory();

        let sys = &state.sys;
        let frequency = sys.cpus().first().map(|c| c.frequency()).unwrap_or(0);
        let total_memory = sys.total_memory();
        let used_memory = sys.used_memory();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_used) = disk_usage(&disks);

        let mut metrics: BTreeMap<String, Value> = BTreeMap::new();
        metrics.insert(
            "cpu".to_string(),
            json!({
                "percent": round1(sys.global_cpu_usage() as f64),
                "count": sys.cpus().len(),
                "frequency": frequency,
            }),
        );
        metrics.insert(
            "memory".to_string(),
            json!({
                "total": total_memory,
                "used": used_memory,
                "percent": percent(used_memory, total_memory),
            }),
        );
        metrics.insert(
            "disk".to_string(),
            json!({
                "total": disk_total,
                "used": disk_used,
                "percent": percent(disk_used, disk_total),
            }),
        );

        debug!("System metrics collected");
        Ok(MetricsSnapshot::new(metrics).with_uptime(System::boot_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(1, 3), 33.3);
    }

    #[tokio::test]
    async fn test_collect_produces_known_metrics() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let source = SystemMetricsSource::new();
        let snapshot = source.collect().await.unwrap();
        for name in ["cpu", "memory", "disk"] {
            assert!(snapshot.metrics.contains_key(name), "missing {}", name);
        }
        assert!(snapshot.uptime.is_some());

        // la seconda raccolta non ha bisogno di attendere il priming
        let second = source.collect().await.unwrap();
        assert!(second.timestamp >= snapshot.timestamp);
    }
}
