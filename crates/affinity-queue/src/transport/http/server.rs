//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, parse_key};
use crate::service::ProcessingService;

use super::routes::routes;

pub const ENV_HOST: &str = "AFFINITY_HOST";
pub const ENV_PORT: &str = "AFFINITY_PORT";
pub const ENV_AWAIT_EXPLICIT_SHUTDOWN: &str = "AFFINITY_AWAIT_EXPLICIT_SHUTDOWN";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parse_key(&lookup, ENV_PORT)? {
            config.port = port;
        }
        if let Some(explicit) = parse_key(&lookup, ENV_AWAIT_EXPLICIT_SHUTDOWN)? {
            config.await_explicit_shutdown = explicit;
        }
        Ok(config)
    }
}

/// Serve the HTTP API until a shutdown signal, then stop the workers.
pub async fn serve(config: ServerConfig, service: Arc<ProcessingService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(Arc::clone(&service));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting affinity-queue server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.await_explicit_shutdown, shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    let drain_timeout = service.settings().drain_timeout;
    let report = service.shutdown(drain_timeout).await;
    info!(?report, "Processing service stopped");

    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. That only happens when the
/// tokio runtime is misconfigured, which should fail fast at startup.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect(
                    "failed to install SIGTERM handler - is tokio runtime configured correctly?",
                )
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert!(!config.await_explicit_shutdown);
    }

    #[test]
    fn server_config_from_lookup() {
        let config = ServerConfig::from_lookup(|key| match key {
            ENV_HOST => Some("127.0.0.1".to_string()),
            ENV_PORT => Some("8080".to_string()),
            ENV_AWAIT_EXPLICIT_SHUTDOWN => Some("true".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert!(config.await_explicit_shutdown);
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = ServerConfig::from_lookup(|key| (key == ENV_PORT).then(|| "70000".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: ENV_PORT, .. }));
    }

    #[tokio::test]
    async fn explicit_shutdown_ends_serving_and_stops_workers() {
        let settings = crate::config::ProcessorSettings::default()
            .with_slots(1)
            .with_workers(1)
            .with_drain_timeout(std::time::Duration::from_secs(1));
        let service = Arc::new(ProcessingService::simulated(settings).unwrap());
        service.start();

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            await_explicit_shutdown: true,
        };
        let server = tokio::spawn(serve(config, Arc::clone(&service)));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        service.trigger_shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server exits after shutdown")
            .unwrap()
            .unwrap();
        assert!(!service.is_running());
        assert!(service.manager().is_disposed());
    }
}
