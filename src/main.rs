use metrics_ws::config::{ServerConfig, jwt_secret_from_env};
use metrics_ws::{MetricsWebSocketServer, SystemMetricsSource, auth::JwtVerifier};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Carica la configurazione dal file in `CONFIG_PATH` se impostato,
/// altrimenti dalle variabili d'ambiente
fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig, String> {
    match path {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::from_env(),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &MetricsWebSocketServer, path: Option<&PathBuf>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("Cannot install SIGHUP handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match load_config(path) {
                    Ok(next) => {
                        let result = server.reload_config(next).await;
                        if !result.is_valid {
                            error!("Reload rejected: {}", result.errors.join("; "));
                        }
                    }
                    Err(e) => error!("Reload failed: {}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &MetricsWebSocketServer, _path: Option<&PathBuf>) {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("metrics_ws=info")),
        )
        .init();

    let config_path = std::env::var("CONFIG_PATH").ok().map(PathBuf::from);
    let config = load_config(config_path.as_ref())?;
    config.print_info();

    let verifier = Arc::new(JwtVerifier::new(&jwt_secret_from_env()));
    let source = Arc::new(SystemMetricsSource::new());

    let mut server = MetricsWebSocketServer::new(config, verifier, source)?;
    if let Some(path) = &config_path {
        server = server.with_config_path(path);
    }

    server.start().await?;
    wait_for_shutdown(&server, config_path.as_ref()).await;

    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}
