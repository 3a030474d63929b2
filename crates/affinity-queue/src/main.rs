use std::sync::Arc;

use affinity_queue::ProcessingService;
use affinity_queue::ProcessorSettings;
use affinity_queue::transport::{ServerConfig, serve};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with AFFINITY_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("AFFINITY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!("affinity_queue={level}", level = base_level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = ProcessorSettings::from_env()?;
    let server_config = ServerConfig::from_env()?;

    tracing::info!(
        slots = settings.total_slots,
        workers = settings.worker_count,
        queue_capacity = settings.queue_capacity,
        acquisition_timeout_ms = settings.acquisition_timeout.as_millis() as u64,
        "Starting affinity-queue"
    );

    let service = Arc::new(ProcessingService::simulated(settings)?);
    service.start();

    serve(server_config, service).await
}
